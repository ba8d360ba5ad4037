//! A connection to one named record, and the operations against it.
//!
//! A [`Channel`] starts life idle: creating one generates no traffic. Calling
//! [`search`][Channel::search] (or one of the conveniences built on it)
//! starts the hunt for the owning server, and from then on the channel moves
//! through its connection lifecycle on its own - connecting, dropping back to
//! previously-connected when the server goes away, reconnecting when it
//! returns. The only terminal state is [`ConnectionState::Closed`], entered
//! by [`clear_channel`][Channel::clear_channel] or by dropping the handle.
//!
//! Reads and writes come in three flavours, mirroring the underlying
//! protocol: buffered fire-and-forget ([`array_put`][Channel::array_put],
//! [`array_get`][Channel::array_get]), buffered with a completion callback
//! ([`array_put_callback`][Channel::array_put_callback],
//! [`array_get_callback`][Channel::array_get_callback]), and blocking
//! conveniences ([`putw`][Channel::putw], [`getw`][Channel::getw]) that
//! combine a buffered request with a bounded `pend_io`.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::debug;

use crate::{
    context::{Context, GetMode, PutMode, invoke},
    dbr::{self, Dbr, DbrBasicType, DbrType, DbrValue},
    status::{ChannelError, ErrorCondition},
    sync_group::GroupCell,
    transport::{ChannelId, ChannelMetadata, EventMask, SubscriptionId},
};

/// Where a channel is in its connection lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created but never asked to find its server
    #[default]
    NeverSearched,
    /// Looking for the owning server; searches repeat until answered
    Searching,
    /// Circuit up, operations allowed
    Connected,
    /// Was connected, lost the server, searching again
    PreviouslyConnected,
    /// Torn down; every subsequent operation fails
    Closed,
}

/// Passed to connection callbacks on every connect and disconnect.
#[derive(Clone, Debug)]
pub struct ConnectionArgs {
    pub name: String,
    pub connected: bool,
}

/// Passed to access rights callbacks when permissions change.
#[derive(Clone, Debug)]
pub struct AccessRightsArgs {
    pub name: String,
    pub read: bool,
    pub write: bool,
}

/// Passed to get and monitor callbacks on completion.
#[derive(Debug)]
pub struct EventArgs {
    pub name: String,
    /// The delivered type, absent when the request failed
    pub dbr_type: Option<DbrType>,
    pub count: usize,
    pub status: Result<Dbr, ErrorCondition>,
}

/// Passed to put callbacks once the server acknowledges the write.
#[derive(Debug)]
pub struct PutArgs {
    pub name: String,
    pub status: Result<(), ErrorCondition>,
}

pub type ConnectionCallback = Box<dyn FnMut(&ConnectionArgs) + Send>;
pub type AccessRightsCallback = Box<dyn FnMut(&AccessRightsArgs) + Send>;
pub type MonitorCallback = Box<dyn FnMut(&EventArgs) + Send>;
pub type GetCallback = Box<dyn FnOnce(EventArgs) + Send>;
pub type PutCallback = Box<dyn FnOnce(PutArgs) + Send>;

/// The monitor parameters held for re-establishment on reconnect.
pub(crate) struct SubscriptionState {
    pub(crate) evid: SubscriptionId,
    pub(crate) dbr_type: DbrType,
    pub(crate) count: usize,
    pub(crate) mask: EventMask,
    pub(crate) as_string: bool,
}

/// Channel state shared between the handle and the context's event routing.
pub(crate) struct ChannelShared {
    pub(crate) name: String,
    pub(crate) cid: ChannelId,
    pub(crate) state: ConnectionState,
    pub(crate) metadata: Option<ChannelMetadata>,
    pub(crate) connection_callback: Option<ConnectionCallback>,
    pub(crate) access_callback: Option<AccessRightsCallback>,
    pub(crate) monitor_callback: Option<MonitorCallback>,
    pub(crate) subscription: Option<SubscriptionState>,
    /// Result slot for parked gets, collected by [`Channel::get_value`]
    pub(crate) pending_value: Option<Result<Dbr, ErrorCondition>>,
}

impl ChannelShared {
    pub(crate) fn new(name: &str, cid: ChannelId) -> Self {
        ChannelShared {
            name: name.to_string(),
            cid,
            state: ConnectionState::NeverSearched,
            metadata: None,
            connection_callback: None,
            access_callback: None,
            monitor_callback: None,
            subscription: None,
            pending_value: None,
        }
    }
}

/// Handle to one process variable.
pub struct Channel {
    shared: Arc<Mutex<ChannelShared>>,
    context: Context,
    timeout: Option<Duration>,
}

impl Channel {
    pub(crate) fn new(context: Context, name: &str) -> Self {
        let shared = context.add_channel(name);
        Channel {
            shared,
            context,
            timeout: None,
        }
    }

    pub fn name(&self) -> String {
        self.shared.lock().unwrap().name.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().unwrap().state
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Override the timeout the blocking conveniences on this channel use.
    /// `None` falls back to the context default.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(self.context.default_timeout())
    }

    fn effective_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.timeout())
    }

    /// Connected-channel metadata, or why it isn't available.
    fn connected_metadata(&self) -> Result<ChannelMetadata, ChannelError> {
        let chan = self.shared.lock().unwrap();
        match chan.state {
            ConnectionState::Closed => Err(ErrorCondition::ChanDestroy.into()),
            ConnectionState::Connected => match &chan.metadata {
                Some(meta) => Ok(meta.clone()),
                None => Err(ErrorCondition::Disconn.into()),
            },
            _ => Err(ErrorCondition::Disconn.into()),
        }
    }

    // ------------------------------------------------------------------
    // Searching and connection management
    // ------------------------------------------------------------------

    /// Buffer a search for this channel's record. The search itself goes out
    /// on the next flush and repeats until a server answers.
    pub fn search(&self) -> Result<(), ChannelError> {
        let (cid, name) = {
            let mut chan = self.shared.lock().unwrap();
            match chan.state {
                ConnectionState::NeverSearched => (),
                ConnectionState::Closed => return Err(ErrorCondition::ChanDestroy.into()),
                _ => return Err(ErrorCondition::BadChId.into()),
            }
            chan.state = ConnectionState::Searching;
            (chan.cid, chan.name.clone())
        };
        self.context.start_search(cid, &name)
    }

    /// [`search`][Channel::search] with a connection callback installed
    /// first, so the very first connect is observed.
    pub fn search_and_connect(
        &self,
        callback: impl FnMut(&ConnectionArgs) + Send + 'static,
    ) -> Result<(), ChannelError> {
        self.change_connection_event(Some(Box::new(callback)))?;
        self.search()
    }

    /// Search and block until connected or the timeout passes.
    pub fn searchw(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.search()?;
        self.context.pend_io(self.effective_timeout(timeout))
    }

    /// Install, replace or remove the connection callback.
    ///
    /// If the channel has already been through its first connection the new
    /// callback is fired immediately with the current state, so a late
    /// installer never misses where things stand.
    pub fn change_connection_event(
        &self,
        callback: Option<ConnectionCallback>,
    ) -> Result<(), ChannelError> {
        let fire = {
            let mut chan = self.shared.lock().unwrap();
            if chan.state == ConnectionState::Closed {
                return Err(ErrorCondition::ChanDestroy.into());
            }
            chan.connection_callback = callback;
            match chan.state {
                ConnectionState::Connected => Some(ConnectionArgs {
                    name: chan.name.clone(),
                    connected: true,
                }),
                ConnectionState::PreviouslyConnected => Some(ConnectionArgs {
                    name: chan.name.clone(),
                    connected: false,
                }),
                _ => None,
            }
        };
        if let Some(args) = fire {
            let taken = self.shared.lock().unwrap().connection_callback.take();
            if let Some(mut callback) = taken {
                invoke(&args.name, || callback(&args));
                let mut chan = self.shared.lock().unwrap();
                if chan.connection_callback.is_none() {
                    chan.connection_callback = Some(callback);
                }
            }
        }
        Ok(())
    }

    /// Install or replace the access rights callback. Fired immediately with
    /// the current rights if the channel is connected.
    pub fn replace_access_rights_event(
        &self,
        callback: Option<AccessRightsCallback>,
    ) -> Result<(), ChannelError> {
        let fire = {
            let mut chan = self.shared.lock().unwrap();
            if chan.state == ConnectionState::Closed {
                return Err(ErrorCondition::ChanDestroy.into());
            }
            chan.access_callback = callback;
            match (&chan.state, &chan.metadata) {
                (ConnectionState::Connected, Some(meta)) => Some(AccessRightsArgs {
                    name: chan.name.clone(),
                    read: meta.read_access,
                    write: meta.write_access,
                }),
                _ => None,
            }
        };
        if let Some(args) = fire {
            let taken = self.shared.lock().unwrap().access_callback.take();
            if let Some(mut callback) = taken {
                invoke(&args.name, || callback(&args));
                let mut chan = self.shared.lock().unwrap();
                if chan.access_callback.is_none() {
                    chan.access_callback = Some(callback);
                }
            }
        }
        Ok(())
    }

    /// Tear the channel down. Idempotent; afterwards every operation on this
    /// handle fails with [`ErrorCondition::ChanDestroy`]. Requests still in
    /// flight are abandoned without their callbacks firing.
    pub fn clear_channel(&self) -> Result<(), ChannelError> {
        let cid = {
            let mut chan = self.shared.lock().unwrap();
            if chan.state == ConnectionState::Closed {
                return Ok(());
            }
            chan.state = ConnectionState::Closed;
            chan.connection_callback = None;
            chan.access_callback = None;
            chan.monitor_callback = None;
            chan.subscription = None;
            chan.pending_value = None;
            chan.cid
        };
        self.context.destroy_channel(cid)
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Work out what actually goes on the wire for a write.
    fn prepare_put(
        &self,
        value: DbrValue,
        req_type: Option<DbrBasicType>,
        count: Option<usize>,
    ) -> Result<(ChannelId, DbrValue, DbrBasicType, usize), ChannelError> {
        let meta = self.connected_metadata()?;
        if !meta.write_access {
            return Err(ErrorCondition::NoWtAccess.into());
        }
        if let Some(count) = count
            && count > meta.element_count
        {
            return Err(ErrorCondition::BadCount.into());
        }
        let (value, count) = dbr::coerce_put_value(
            &value,
            req_type,
            count,
            meta.native_type,
            meta.element_count,
            &meta.enum_states,
        )?;
        let sent_type = value.get_type();
        let cid = self.shared.lock().unwrap().cid;
        Ok((cid, value, sent_type, count))
    }

    /// Buffer a fire-and-forget write. It leaves the program on the next
    /// flush; no completion is ever reported.
    pub fn array_put(
        &self,
        value: impl Into<DbrValue>,
        req_type: Option<DbrBasicType>,
        count: Option<usize>,
    ) -> Result<(), ChannelError> {
        let (cid, value, sent_type, count) = self.prepare_put(value.into(), req_type, count)?;
        self.context
            .issue_put(cid, value, sent_type, count, PutMode::Fire)
    }

    /// Buffer an acknowledged write. The callback fires from inside a pend
    /// primitive once the server reports the value fully processed.
    pub fn array_put_callback(
        &self,
        value: impl Into<DbrValue>,
        req_type: Option<DbrBasicType>,
        count: Option<usize>,
        callback: impl FnOnce(PutArgs) + Send + 'static,
    ) -> Result<(), ChannelError> {
        let (cid, value, sent_type, count) = self.prepare_put(value.into(), req_type, count)?;
        self.context.issue_put(
            cid,
            value,
            sent_type,
            count,
            PutMode::Callback(Box::new(callback)),
        )
    }

    /// Write and flush, bounded by the channel timeout.
    pub fn putw(
        &self,
        value: impl Into<DbrValue>,
        req_type: Option<DbrBasicType>,
    ) -> Result<(), ChannelError> {
        self.array_put(value, req_type, None)?;
        self.context.pend_io(self.timeout())
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Resolve the request type and count for a read, applying the
    /// char-as-string substitution where it fits.
    fn prepare_get(
        &self,
        req_type: Option<DbrType>,
        count: Option<usize>,
    ) -> Result<(ChannelId, DbrType, usize, bool), ChannelError> {
        let meta = self.connected_metadata()?;
        if !meta.read_access {
            return Err(ErrorCondition::NoRdAccess.into());
        }
        let mut dbr_type = req_type.unwrap_or(DbrType::basic(meta.native_type));
        // A char array asked for "as string" is fetched as the full char
        // array and reassembled on delivery
        let as_string = dbr_type.basic_type == DbrBasicType::String
            && meta.native_type == DbrBasicType::Char;
        let count = if as_string {
            dbr_type.basic_type = DbrBasicType::Char;
            meta.element_count
        } else {
            // Asking for more elements than exist is capped, not an error
            count
                .unwrap_or(meta.element_count)
                .min(meta.element_count)
        };
        let cid = self.shared.lock().unwrap().cid;
        Ok((cid, dbr_type, count, as_string))
    }

    /// Buffer a read whose result is parked on the channel, to be collected
    /// with [`get_value`][Channel::get_value] after a successful `pend_io`.
    pub fn array_get(
        &self,
        req_type: Option<DbrType>,
        count: Option<usize>,
    ) -> Result<(), ChannelError> {
        let (cid, dbr_type, count, as_string) = self.prepare_get(req_type, count)?;
        self.context
            .issue_get(cid, dbr_type, count, as_string, GetMode::Wait)
    }

    /// Buffer a read delivered to a one-shot callback instead of parked.
    pub fn array_get_callback(
        &self,
        req_type: Option<DbrType>,
        count: Option<usize>,
        callback: impl FnOnce(EventArgs) + Send + 'static,
    ) -> Result<(), ChannelError> {
        let (cid, dbr_type, count, as_string) = self.prepare_get(req_type, count)?;
        self.context.issue_get(
            cid,
            dbr_type,
            count,
            as_string,
            GetMode::Callback(Box::new(callback)),
        )
    }

    /// Collect the value parked by the most recent [`array_get`]
    /// completion. Consumes the slot.
    ///
    /// [`array_get`]: Channel::array_get
    pub fn get_value(&self) -> Result<Dbr, ChannelError> {
        let mut chan = self.shared.lock().unwrap();
        if chan.state == ConnectionState::Closed {
            return Err(ErrorCondition::ChanDestroy.into());
        }
        match chan.pending_value.take() {
            Some(Ok(dbr)) => Ok(dbr),
            Some(Err(condition)) => Err(condition.into()),
            None => Err(ErrorCondition::GetFail.into()),
        }
    }

    /// Read and wait: buffer the request, pend until it completes, hand the
    /// value back. Bounded by the channel timeout.
    pub fn getw(
        &self,
        req_type: Option<DbrType>,
        count: Option<usize>,
    ) -> Result<Dbr, ChannelError> {
        self.array_get(req_type, count)?;
        self.context.pend_io(self.timeout())?;
        self.get_value()
    }

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    /// Subscribe to value changes matching `mask`. The server sends the
    /// current value as the first update once the subscription stands.
    ///
    /// A channel carries at most one subscription: installing a new one
    /// replaces the old, and the replacement is flushed so the old stream
    /// stops before the new one starts.
    pub fn add_masked_array_event(
        &self,
        req_type: Option<DbrType>,
        count: Option<usize>,
        mask: EventMask,
        callback: impl FnMut(&EventArgs) + Send + 'static,
    ) -> Result<(), ChannelError> {
        self.clear_event()?;
        let (cid, dbr_type, count, as_string) = self.prepare_get(req_type, count)?;
        let evid = self.context.issue_subscription(cid, dbr_type, count, mask)?;
        {
            let mut chan = self.shared.lock().unwrap();
            chan.subscription = Some(SubscriptionState {
                evid,
                dbr_type,
                count,
                mask,
                as_string,
            });
            chan.monitor_callback = Some(Box::new(callback));
        }
        Ok(())
    }

    /// Cancel the active subscription, if any. Clearing a channel with no
    /// subscription is not an error.
    pub fn clear_event(&self) -> Result<(), ChannelError> {
        let evid = {
            let mut chan = self.shared.lock().unwrap();
            chan.monitor_callback = None;
            chan.subscription.take().map(|sub| sub.evid)
        };
        match evid {
            Some(evid) => {
                self.context.cancel_subscription(evid)?;
                self.context.flush_io()
            }
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Introspection, valid only while connected
    // ------------------------------------------------------------------

    /// The server-side native type of the record's value field.
    pub fn field_type(&self) -> Result<DbrBasicType, ChannelError> {
        Ok(self.connected_metadata()?.native_type)
    }

    /// The server-side native element count.
    pub fn element_count(&self) -> Result<usize, ChannelError> {
        Ok(self.connected_metadata()?.element_count)
    }

    pub fn host_name(&self) -> Result<String, ChannelError> {
        Ok(self.connected_metadata()?.host_name)
    }

    pub fn read_access(&self) -> Result<bool, ChannelError> {
        Ok(self.connected_metadata()?.read_access)
    }

    pub fn write_access(&self) -> Result<bool, ChannelError> {
        Ok(self.connected_metadata()?.write_access)
    }

    // ------------------------------------------------------------------
    // Event-processing conveniences, delegating to the context
    // ------------------------------------------------------------------

    pub fn pend_io(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.context.pend_io(self.effective_timeout(timeout))
    }

    pub fn pend_event(&self, duration: Duration) -> Result<(), ChannelError> {
        self.context.pend_event(duration)
    }

    pub fn poll(&self) -> Result<(), ChannelError> {
        self.context.poll()
    }

    pub fn flush_io(&self) -> Result<(), ChannelError> {
        self.context.flush_io()
    }

    // ------------------------------------------------------------------
    // Sync group entry points
    // ------------------------------------------------------------------

    pub(crate) fn group_get(
        &self,
        req_type: Option<DbrType>,
        count: Option<usize>,
        cell: Arc<Mutex<GroupCell>>,
    ) -> Result<(), ChannelError> {
        let (cid, dbr_type, count, as_string) = self.prepare_get(req_type, count)?;
        self.context
            .issue_get(cid, dbr_type, count, as_string, GetMode::Group(cell))
    }

    pub(crate) fn group_put(
        &self,
        value: DbrValue,
        req_type: Option<DbrBasicType>,
        count: Option<usize>,
        cell: Arc<Mutex<GroupCell>>,
    ) -> Result<(), ChannelError> {
        let (cid, value, sent_type, count) = self.prepare_put(value, req_type, count)?;
        self.context
            .issue_put(cid, value, sent_type, count, PutMode::Group(cell))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Teardown failure at drop has nowhere useful to go
        if let Err(e) = self.clear_channel() {
            debug!("Failed to clear channel '{}' on drop: {e}", self.name());
        } else if let Err(e) = self.context.flush_io() {
            debug!("Failed to flush teardown of '{}': {e}", self.name());
        }
    }
}
