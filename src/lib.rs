// #![warn(missing_docs)]

//! Client-side channel access to EPICS-style process variables.
//!
//! This crate is the layer a control program sits on: it resolves named
//! records to a server, keeps the connections alive, and moves typed values
//! back and forth. It does not depend on the C-based [epics-base] project at
//! all, and the wire itself is behind the [`transport::Transport`] trait - an
//! in-process [`loopback::Loopback`] server ships with the crate so the whole
//! stack can run without a network.
//!
//! The moving parts:
//!
//! - A [`Context`] owns the transport and every channel created from it.
//!   Requests made against channels are *buffered*: nothing goes out, and no
//!   callback ever runs, except inside one of the four event-processing
//!   primitives ([`Context::pend_io`], [`Context::pend_event`],
//!   [`Context::poll`], [`Context::flush_io`]). That makes the whole layer a
//!   single cooperative event loop - code that never pends never gets
//!   interrupted.
//! - A [`Channel`] is the handle to one named record. It searches, connects,
//!   reconnects after server loss, and carries the read/write/monitor
//!   operations plus introspection of the record's native type and count.
//! - Data travels as ["DBR" types] modelled in [dbr]: seven basic value
//!   types crossed with five metadata layers, from the bare value up to full
//!   control metadata with units, limits and precision.
//! - A [`SyncGroup`] batches reads and writes across many channels and lets
//!   the caller wait on the batch while tracking each member's outcome
//!   individually.
//!
//! ## Example
//!
//! Reading and writing a served record through the in-process loopback:
//!
//! ```
//! use cachannel::{Context, loopback::{Loopback, RecordSpec}};
//!
//! let server = Loopback::new();
//! server.add_record("TEMPERATURE", RecordSpec::new(21.5f64).units("C"));
//!
//! let ctx = Context::new(Box::new(server.clone()));
//! let channel = ctx.create_channel("TEMPERATURE");
//! channel.searchw(None).unwrap();
//! channel.putw(23.0f64, None).unwrap();
//! let value = channel.getw(None, None).unwrap();
//! assert_eq!(Vec::<f64>::try_from(value.value()).unwrap(), vec![23.0]);
//! ```
//!
//! [epics-base]: https://github.com/epics-base/epics-base
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod channel;
mod context;
pub mod dbr;
pub mod loopback;
mod status;
mod sync_group;
pub mod transport;
mod utils;

pub use crate::channel::{Channel, ConnectionState};
pub use crate::context::Context;
pub use crate::status::{ChannelError, ErrorCondition, ErrorSeverity};
pub use crate::sync_group::{GroupOp, GroupOutcome, SyncGroup};
pub use crate::transport::EventMask;
pub use crate::utils::get_default_timeout;
