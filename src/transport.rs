//! The boundary between the channel layer and whatever carries requests.
//!
//! Everything above this module is transport-agnostic: the [`Context`][c]
//! merely buffers requests into a [`Transport`] and drains [`TransportEvent`]s
//! back out of it during the event-processing primitives. A real network
//! transport, or the in-process [`Loopback`][l] used for testing, plug in
//! behind the same trait.
//!
//! [c]: crate::context::Context
//! [l]: crate::loopback::Loopback

use std::time::Duration;

use crate::{
    dbr::{Dbr, DbrBasicType, DbrType, DbrValue},
    status::ErrorCondition,
};

/// Identifies a channel within one context.
pub type ChannelId = u32;
/// Identifies one outstanding get or put request.
pub type IoId = u32;
/// Identifies an active value subscription.
pub type SubscriptionId = u32;

/// What a transport reports about a channel once its server is found.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelMetadata {
    pub native_type: DbrBasicType,
    pub element_count: usize,
    pub host_name: String,
    pub read_access: bool,
    pub write_access: bool,
    /// State labels, populated only for enumerated fields
    pub enum_states: Vec<String>,
}

/// Which record transitions wake a subscription.
///
/// The default matches the common "value or alarm" monitor: deadband-filtered
/// value changes plus alarm state changes, without the archival stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
}

impl Default for EventMask {
    fn default() -> Self {
        Self {
            value: true,
            log: false,
            alarm: true,
        }
    }
}

/// Events a transport delivers back to the channel layer.
#[derive(Debug)]
pub enum TransportEvent {
    /// A search resolved and the circuit to the owning server is up
    Connected {
        cid: ChannelId,
        metadata: ChannelMetadata,
    },
    /// The circuit dropped; the channel keeps searching for a new server
    Disconnected { cid: ChannelId },
    /// The server revised our read/write permissions
    AccessRights {
        cid: ChannelId,
        read: bool,
        write: bool,
    },
    /// A read completed, with the value on success
    GetComplete {
        ioid: IoId,
        status: Result<Dbr, ErrorCondition>,
    },
    /// An acknowledged write completed
    PutComplete {
        ioid: IoId,
        status: Result<(), ErrorCondition>,
    },
    /// A subscription fired
    MonitorUpdate {
        evid: SubscriptionId,
        status: Result<Dbr, ErrorCondition>,
    },
}

/// A request carrier the channel layer can drive.
///
/// All request methods buffer: nothing is transmitted until [`flush`] is
/// called, and no completion is observed until [`process`] runs. Both of
/// those only ever happen from inside the event-processing primitives, which
/// is what makes the whole layer single-threaded and cooperative.
///
/// [`flush`]: Transport::flush
/// [`process`]: Transport::process
pub trait Transport: Send {
    /// Start searching for the named record. Repeats search until found.
    fn create_channel(&mut self, cid: ChannelId, name: &str);

    /// Tear down a channel. Outstanding requests against it are dropped.
    fn clear_channel(&mut self, cid: ChannelId);

    /// Request a read of `count` elements as `dbr_type`.
    fn get(&mut self, cid: ChannelId, ioid: IoId, dbr_type: DbrType, count: usize);

    /// Request a write. An `ioid` asks for server acknowledgement; `None` is
    /// fire-and-forget.
    fn put(
        &mut self,
        cid: ChannelId,
        ioid: Option<IoId>,
        dbr_type: DbrBasicType,
        count: usize,
        value: DbrValue,
    );

    /// Begin a subscription. The transport sends an initial update with the
    /// current value once the subscription is established.
    fn create_subscription(
        &mut self,
        cid: ChannelId,
        evid: SubscriptionId,
        dbr_type: DbrType,
        count: usize,
        mask: EventMask,
    );

    /// End a subscription. No further updates for `evid` will be delivered.
    fn clear_subscription(&mut self, evid: SubscriptionId);

    /// Transmit everything buffered so far. Fails when the underlying send
    /// does, with the condition the caller should see.
    fn flush(&mut self) -> Result<(), ErrorCondition>;

    /// Spend up to `budget` receiving, handing each completion to `sink`.
    /// Returns early once the transport has nothing more to deliver. The
    /// caller flushes before processing.
    fn process(&mut self, budget: Duration, sink: &mut dyn FnMut(TransportEvent));
}
