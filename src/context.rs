//! The per-program context that owns channels and drives their transport.
//!
//! All channel activity funnels through a [`Context`]: channels register with
//! it, requests are buffered into its transport, and nothing completes until
//! one of the event-processing primitives runs. Those primitives - `pend_io`,
//! `pend_event`, `poll` and `flush_io` - are the only places callbacks ever
//! fire, which gives the layer its single cooperative event loop: a caller
//! that never pends never observes a callback.
//!
//! A context binds to the thread using it for the duration of each operation.
//! Two threads driving the same context concurrently is an error
//! ([`ErrorCondition::IsAttached`]), not a data race.

use std::{
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use tracing::{debug, error};

use crate::{
    channel::{
        AccessRightsArgs, Channel, ChannelShared, ConnectionArgs, ConnectionState, EventArgs,
        GetCallback, PutArgs, PutCallback,
    },
    dbr::{Dbr, DbrBasicType, DbrType, DbrValue},
    status::{ChannelError, ErrorCondition},
    sync_group::{GroupCell, GroupOutcome, SyncGroup},
    transport::{ChannelId, EventMask, IoId, SubscriptionId, Transport, TransportEvent},
    utils,
};

/// How a completed get is delivered.
pub(crate) enum GetMode {
    /// Park the result on the channel, to be collected after `pend_io`
    Wait,
    /// Invoke a one-shot callback from inside a pend primitive
    Callback(GetCallback),
    /// Fill a sync group member cell
    Group(Arc<Mutex<GroupCell>>),
}

/// How a write is issued and its completion delivered.
pub(crate) enum PutMode {
    /// Fire-and-forget: complete at flush, no acknowledgement tracked
    Fire,
    /// Ask for server acknowledgement and invoke a one-shot callback
    Callback(PutCallback),
    /// Ask for acknowledgement and fill a sync group member cell
    Group(Arc<Mutex<GroupCell>>),
}

struct PendingGet {
    cid: ChannelId,
    mode: GetMode,
    as_string: bool,
}

struct PendingPut {
    cid: ChannelId,
    mode: PutMode,
}

/// A request `pend_io` is on the hook for.
///
/// Only searches and Wait-mode gets gate `pend_io`; acknowledged puts and
/// callback gets complete whenever their events arrive.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum IoKey {
    Search(ChannelId),
    Get(IoId),
}

struct ContextInner {
    transport: Box<dyn Transport>,
    channels: HashMap<ChannelId, Arc<Mutex<ChannelShared>>>,
    pending_gets: HashMap<IoId, PendingGet>,
    pending_puts: HashMap<IoId, PendingPut>,
    subscriptions: HashMap<SubscriptionId, ChannelId>,
    pending_io: HashSet<IoKey>,
    next_cid: ChannelId,
    next_ioid: IoId,
    next_evid: SubscriptionId,
}

struct ContextState {
    inner: Mutex<ContextInner>,
    /// Owning thread and attach depth; released when the depth reaches zero
    attached: Mutex<(Option<ThreadId>, u32)>,
    dispatching: AtomicBool,
}

/// Deferred callback invocation, collected while routing events under the
/// context lock and executed with no locks held.
enum Action {
    Connection {
        shared: Arc<Mutex<ChannelShared>>,
        args: ConnectionArgs,
    },
    AccessRights {
        shared: Arc<Mutex<ChannelShared>>,
        args: AccessRightsArgs,
    },
    Get {
        callback: GetCallback,
        args: EventArgs,
    },
    Put {
        callback: PutCallback,
        args: PutArgs,
    },
    Monitor {
        shared: Arc<Mutex<ChannelShared>>,
        args: EventArgs,
    },
}

/// Handle to the channel layer. Cheap to clone; all clones drive the same
/// transport and channel set.
#[derive(Clone)]
pub struct Context {
    state: Arc<ContextState>,
    default_timeout: Duration,
}

/// Releases the per-operation thread binding on drop.
pub(crate) struct AttachGuard {
    state: Arc<ContextState>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        let mut attached = self.state.attached.lock().unwrap();
        attached.1 -= 1;
        if attached.1 == 0 {
            attached.0 = None;
        }
    }
}

impl Context {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Context {
            state: Arc::new(ContextState {
                inner: Mutex::new(ContextInner {
                    transport,
                    channels: HashMap::new(),
                    pending_gets: HashMap::new(),
                    pending_puts: HashMap::new(),
                    subscriptions: HashMap::new(),
                    pending_io: HashSet::new(),
                    next_cid: 1,
                    next_ioid: 1,
                    next_evid: 1,
                }),
                attached: Mutex::new((None, 0)),
                dispatching: AtomicBool::new(false),
            }),
            default_timeout: utils::get_default_timeout(),
        }
    }

    /// The timeout the convenience operations use when none is set on the
    /// channel, read from `EPICS_CA_TIMEOUT` at context creation.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Create a channel for the named record. No traffic is generated until
    /// the channel searches.
    pub fn create_channel(&self, name: &str) -> Channel {
        Channel::new(self.clone(), name)
    }

    /// Create an empty synchronization group over this context.
    pub fn create_sync_group(&self) -> SyncGroup {
        SyncGroup::new(self.clone())
    }

    /// Bind the calling thread to this context for one operation.
    pub(crate) fn attach(&self) -> Result<AttachGuard, ChannelError> {
        let current = thread::current().id();
        let mut attached = self.state.attached.lock().unwrap();
        match attached.0 {
            Some(owner) if owner != current => Err(ErrorCondition::IsAttached.into()),
            _ => {
                attached.0 = Some(current);
                attached.1 += 1;
                Ok(AttachGuard {
                    state: Arc::clone(&self.state),
                })
            }
        }
    }

    fn ensure_not_dispatching(&self) -> Result<(), ChannelError> {
        if self.state.dispatching.load(Ordering::Acquire) {
            Err(ErrorCondition::EvDisallow.into())
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Request plumbing, called from the channel layer. All of these buffer.
    // ------------------------------------------------------------------

    pub(crate) fn add_channel(&self, name: &str) -> Arc<Mutex<ChannelShared>> {
        let mut inner = self.state.inner.lock().unwrap();
        let cid = utils::wrapping_inplace_add(&mut inner.next_cid);
        let shared = Arc::new(Mutex::new(ChannelShared::new(name, cid)));
        inner.channels.insert(cid, Arc::clone(&shared));
        shared
    }

    pub(crate) fn start_search(&self, cid: ChannelId, name: &str) -> Result<(), ChannelError> {
        let _guard = self.attach()?;
        let mut inner = self.state.inner.lock().unwrap();
        inner.transport.create_channel(cid, name);
        inner.pending_io.insert(IoKey::Search(cid));
        Ok(())
    }

    pub(crate) fn issue_get(
        &self,
        cid: ChannelId,
        dbr_type: DbrType,
        count: usize,
        as_string: bool,
        mode: GetMode,
    ) -> Result<(), ChannelError> {
        let _guard = self.attach()?;
        let mut inner = self.state.inner.lock().unwrap();
        let ioid = utils::wrapping_inplace_add(&mut inner.next_ioid);
        if matches!(mode, GetMode::Wait) {
            inner.pending_io.insert(IoKey::Get(ioid));
        }
        inner.pending_gets.insert(
            ioid,
            PendingGet {
                cid,
                mode,
                as_string,
            },
        );
        inner.transport.get(cid, ioid, dbr_type, count);
        Ok(())
    }

    pub(crate) fn issue_put(
        &self,
        cid: ChannelId,
        value: DbrValue,
        dbr_type: DbrBasicType,
        count: usize,
        mode: PutMode,
    ) -> Result<(), ChannelError> {
        let _guard = self.attach()?;
        let mut inner = self.state.inner.lock().unwrap();
        let ioid = match mode {
            PutMode::Fire => None,
            _ => Some(utils::wrapping_inplace_add(&mut inner.next_ioid)),
        };
        if let Some(ioid) = ioid {
            inner.pending_puts.insert(ioid, PendingPut { cid, mode });
        }
        inner.transport.put(cid, ioid, dbr_type, count, value);
        Ok(())
    }

    pub(crate) fn issue_subscription(
        &self,
        cid: ChannelId,
        dbr_type: DbrType,
        count: usize,
        mask: EventMask,
    ) -> Result<SubscriptionId, ChannelError> {
        let _guard = self.attach()?;
        let mut inner = self.state.inner.lock().unwrap();
        let evid = utils::wrapping_inplace_add(&mut inner.next_evid);
        inner.subscriptions.insert(evid, cid);
        inner
            .transport
            .create_subscription(cid, evid, dbr_type, count, mask);
        Ok(evid)
    }

    pub(crate) fn cancel_subscription(&self, evid: SubscriptionId) -> Result<(), ChannelError> {
        let _guard = self.attach()?;
        let mut inner = self.state.inner.lock().unwrap();
        inner.subscriptions.remove(&evid);
        inner.transport.clear_subscription(evid);
        Ok(())
    }

    /// Tear the channel down at the transport and fail everything still
    /// outstanding against it. No callback fires for an op the teardown
    /// abandons.
    pub(crate) fn destroy_channel(&self, cid: ChannelId) -> Result<(), ChannelError> {
        let _guard = self.attach()?;
        let mut inner = self.state.inner.lock().unwrap();
        inner.channels.remove(&cid);
        inner.pending_io.remove(&IoKey::Search(cid));

        let dead_gets: Vec<IoId> = inner
            .pending_gets
            .iter()
            .filter(|(_, p)| p.cid == cid)
            .map(|(ioid, _)| *ioid)
            .collect();
        for ioid in dead_gets {
            inner.pending_io.remove(&IoKey::Get(ioid));
            if let Some(pending) = inner.pending_gets.remove(&ioid)
                && let GetMode::Group(cell) = pending.mode
            {
                cell.lock().unwrap().outcome = Some(Err(ErrorCondition::ChanDestroy));
            }
        }
        let dead_puts: Vec<IoId> = inner
            .pending_puts
            .iter()
            .filter(|(_, p)| p.cid == cid)
            .map(|(ioid, _)| *ioid)
            .collect();
        for ioid in dead_puts {
            if let Some(pending) = inner.pending_puts.remove(&ioid)
                && let PutMode::Group(cell) = pending.mode
            {
                cell.lock().unwrap().outcome = Some(Err(ErrorCondition::ChanDestroy));
            }
        }
        let dead_subs: Vec<SubscriptionId> = inner
            .subscriptions
            .iter()
            .filter(|(_, sub_cid)| **sub_cid == cid)
            .map(|(evid, _)| *evid)
            .collect();
        for evid in dead_subs {
            inner.subscriptions.remove(&evid);
            inner.transport.clear_subscription(evid);
        }

        inner.transport.clear_channel(cid);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event-processing primitives
    // ------------------------------------------------------------------

    /// Transmit all buffered requests without waiting for any completion,
    /// reporting a failed send. Safe to call from inside a callback: sending
    /// never dispatches.
    pub fn flush_io(&self) -> Result<(), ChannelError> {
        let _guard = self.attach()?;
        self.state.inner.lock().unwrap().transport.flush()?;
        Ok(())
    }

    /// Flush, then wait until every outstanding search and parked get has
    /// completed, or until the timeout expires.
    ///
    /// A zero timeout waits forever. On expiry the outstanding requests are
    /// abandoned: parked gets complete with a timeout error and outstanding
    /// searches no longer gate future calls (the channels themselves keep
    /// searching).
    pub fn pend_io(&self, timeout: Duration) -> Result<(), ChannelError> {
        let _guard = self.attach()?;
        self.ensure_not_dispatching()?;
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            self.process_once(utils::service_tick())?;
            if self.state.inner.lock().unwrap().pending_io.is_empty() {
                return Ok(());
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                self.abandon_pending_io();
                return Err(ErrorCondition::Timeout.into());
            }
        }
    }

    /// Flush, then process events for exactly `duration`.
    ///
    /// Unlike [`pend_io`][Context::pend_io] this never returns early: the
    /// full duration is consumed regardless of how much or little arrives.
    /// It is the primitive monitor-driven programs sit in.
    pub fn pend_event(&self, duration: Duration) -> Result<(), ChannelError> {
        let _guard = self.attach()?;
        self.ensure_not_dispatching()?;
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            self.process_once(remaining.min(utils::service_tick()))?;
        }
    }

    /// A single non-blocking turn of the event loop: flush, deliver whatever
    /// has already arrived, return.
    pub fn poll(&self) -> Result<(), ChannelError> {
        let _guard = self.attach()?;
        self.ensure_not_dispatching()?;
        self.process_once(Duration::ZERO)
    }

    fn process_once(&self, budget: Duration) -> Result<(), ChannelError> {
        let mut events = Vec::new();
        {
            let mut inner = self.state.inner.lock().unwrap();
            inner.transport.flush()?;
            inner.transport.process(budget, &mut |ev| events.push(ev));
        }
        for event in events {
            let actions = self.route(event);
            self.dispatch(actions);
        }
        Ok(())
    }

    /// Fail everything `pend_io` was waiting on after a timeout.
    fn abandon_pending_io(&self) {
        let mut inner = self.state.inner.lock().unwrap();
        let abandoned: Vec<IoKey> = inner.pending_io.drain().collect();
        for key in abandoned {
            if let IoKey::Get(ioid) = key
                && let Some(pending) = inner.pending_gets.remove(&ioid)
                && let Some(shared) = inner.channels.get(&pending.cid)
            {
                shared.lock().unwrap().pending_value = Some(Err(ErrorCondition::Timeout));
            }
        }
    }

    /// Apply one transport event to the channel state, collecting the user
    /// callbacks it triggers. Runs entirely under the context lock; the
    /// returned actions are invoked afterwards with no locks held.
    fn route(&self, event: TransportEvent) -> Vec<Action> {
        let mut inner = self.state.inner.lock().unwrap();
        let mut actions = Vec::new();
        match event {
            TransportEvent::Connected { cid, metadata } => {
                inner.pending_io.remove(&IoKey::Search(cid));
                let Some(shared) = inner.channels.get(&cid).cloned() else {
                    return actions;
                };
                let resubscribe = {
                    let mut chan = shared.lock().unwrap();
                    chan.state = ConnectionState::Connected;
                    chan.metadata = Some(metadata);
                    chan.subscription
                        .as_ref()
                        .map(|sub| (sub.evid, sub.dbr_type, sub.count, sub.mask))
                };
                // A monitor survives reconnection without caller involvement
                if let Some((evid, dbr_type, count, mask)) = resubscribe {
                    inner
                        .transport
                        .create_subscription(cid, evid, dbr_type, count, mask);
                }
                let name = shared.lock().unwrap().name.clone();
                actions.push(Action::Connection {
                    shared,
                    args: ConnectionArgs {
                        name,
                        connected: true,
                    },
                });
            }
            TransportEvent::Disconnected { cid } => {
                let Some(shared) = inner.channels.get(&cid).cloned() else {
                    return actions;
                };
                let name = {
                    let mut chan = shared.lock().unwrap();
                    chan.state = ConnectionState::PreviouslyConnected;
                    chan.name.clone()
                };
                actions.push(Action::Connection {
                    shared,
                    args: ConnectionArgs {
                        name,
                        connected: false,
                    },
                });
            }
            TransportEvent::AccessRights { cid, read, write } => {
                let Some(shared) = inner.channels.get(&cid).cloned() else {
                    return actions;
                };
                let name = {
                    let mut chan = shared.lock().unwrap();
                    if let Some(meta) = chan.metadata.as_mut() {
                        meta.read_access = read;
                        meta.write_access = write;
                    }
                    chan.name.clone()
                };
                actions.push(Action::AccessRights {
                    shared,
                    args: AccessRightsArgs { name, read, write },
                });
            }
            TransportEvent::GetComplete { ioid, status } => {
                let Some(pending) = inner.pending_gets.remove(&ioid) else {
                    debug!("Dropping reply for unknown read request {ioid}");
                    return actions;
                };
                inner.pending_io.remove(&IoKey::Get(ioid));
                let status = finish_get(status, pending.as_string);
                let Some(shared) = inner.channels.get(&pending.cid).cloned() else {
                    return actions;
                };
                match pending.mode {
                    GetMode::Wait => {
                        shared.lock().unwrap().pending_value = Some(status);
                    }
                    GetMode::Callback(callback) => {
                        let args = event_args(&shared, status);
                        actions.push(Action::Get { callback, args });
                    }
                    GetMode::Group(cell) => {
                        cell.lock().unwrap().outcome = Some(status.map(GroupOutcome::Value));
                    }
                }
            }
            TransportEvent::PutComplete { ioid, status } => {
                let Some(pending) = inner.pending_puts.remove(&ioid) else {
                    debug!("Dropping reply for unknown write request {ioid}");
                    return actions;
                };
                let Some(shared) = inner.channels.get(&pending.cid).cloned() else {
                    return actions;
                };
                match pending.mode {
                    PutMode::Fire => (),
                    PutMode::Callback(callback) => {
                        let name = shared.lock().unwrap().name.clone();
                        actions.push(Action::Put {
                            callback,
                            args: PutArgs { name, status },
                        });
                    }
                    PutMode::Group(cell) => {
                        cell.lock().unwrap().outcome =
                            Some(status.map(|_| GroupOutcome::Acknowledged));
                    }
                }
            }
            TransportEvent::MonitorUpdate { evid, status } => {
                let Some(cid) = inner.subscriptions.get(&evid).copied() else {
                    debug!("Dropping update for cancelled subscription {evid}");
                    return actions;
                };
                let Some(shared) = inner.channels.get(&cid).cloned() else {
                    return actions;
                };
                let as_string = {
                    let chan = shared.lock().unwrap();
                    chan.subscription.as_ref().is_some_and(|s| s.as_string)
                };
                let status = finish_get(status, as_string);
                let args = event_args(&shared, status);
                actions.push(Action::Monitor { shared, args });
            }
        }
        actions
    }

    /// Invoke collected user callbacks with no locks held. The dispatching
    /// flag is up for the duration, so a callback that tries to pend gets
    /// [`ErrorCondition::EvDisallow`] instead of re-entering the loop.
    fn dispatch(&self, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }
        self.state.dispatching.store(true, Ordering::Release);
        for action in actions {
            match action {
                Action::Connection { shared, args } => {
                    let taken = shared.lock().unwrap().connection_callback.take();
                    if let Some(mut callback) = taken {
                        invoke(&args.name, || callback(&args));
                        let mut chan = shared.lock().unwrap();
                        if chan.connection_callback.is_none() {
                            chan.connection_callback = Some(callback);
                        }
                    }
                }
                Action::AccessRights { shared, args } => {
                    let taken = shared.lock().unwrap().access_callback.take();
                    if let Some(mut callback) = taken {
                        invoke(&args.name, || callback(&args));
                        let mut chan = shared.lock().unwrap();
                        if chan.access_callback.is_none() {
                            chan.access_callback = Some(callback);
                        }
                    }
                }
                Action::Get { callback, args } => {
                    let name = args.name.clone();
                    invoke(&name, move || callback(args));
                }
                Action::Put { callback, args } => {
                    let name = args.name.clone();
                    invoke(&name, move || callback(args));
                }
                Action::Monitor { shared, args } => {
                    let taken = shared.lock().unwrap().monitor_callback.take();
                    if let Some(mut callback) = taken {
                        invoke(&args.name, || callback(&args));
                        let mut chan = shared.lock().unwrap();
                        // The monitor may have been cleared or replaced from
                        // inside the callback
                        if chan.subscription.is_some() && chan.monitor_callback.is_none() {
                            chan.monitor_callback = Some(callback);
                        }
                    }
                }
            }
        }
        self.state.dispatching.store(false, Ordering::Release);
    }
}

/// Run one user callback, containing any panic it raises. A panicking
/// callback must not take the event loop down with it.
pub(crate) fn invoke<F: FnOnce()>(name: &str, callback: F) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("User callback for channel '{name}' panicked");
    }
}

/// Post-process a completed read: char arrays fetched "as string" are
/// reassembled before the caller ever sees them.
fn finish_get(
    status: Result<Dbr, ErrorCondition>,
    as_string: bool,
) -> Result<Dbr, ErrorCondition> {
    let mut dbr = status?;
    if as_string {
        let assembled = dbr
            .value()
            .chars_as_string()
            .ok_or(ErrorCondition::NoConvert)?;
        *dbr.value_mut() = DbrValue::String(vec![assembled]);
    }
    Ok(dbr)
}

fn event_args(
    shared: &Arc<Mutex<ChannelShared>>,
    status: Result<Dbr, ErrorCondition>,
) -> EventArgs {
    let name = shared.lock().unwrap().name.clone();
    let (dbr_type, count) = match &status {
        Ok(dbr) => (Some(dbr.data_type()), dbr.value().get_count()),
        Err(_) => (None, 0),
    };
    EventArgs {
        name,
        dbr_type,
        count,
        status,
    }
}
