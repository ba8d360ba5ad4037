//! Batched reads and writes over several channels at once.
//!
//! A [`SyncGroup`] is bookkeeping, not a protocol feature: each operation
//! added to it is an ordinary buffered request whose completion lands in a
//! per-member cell instead of a callback. [`test`][SyncGroup::test] asks
//! whether the whole batch has landed, [`block`][SyncGroup::block] waits for
//! it, and each [`GroupOp`] handle reports its member's individual outcome -
//! one member failing or timing out never disturbs the others.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    channel::Channel,
    context::Context,
    dbr::{Dbr, DbrBasicType, DbrType, DbrValue},
    status::{ChannelError, ErrorCondition},
    utils,
};

/// What one completed member produced.
#[derive(Clone, Debug)]
pub enum GroupOutcome {
    /// A read, with the delivered value
    Value(Dbr),
    /// An acknowledged write
    Acknowledged,
}

/// Completion slot shared between a [`GroupOp`] and the event routing.
pub(crate) struct GroupCell {
    pub(crate) outcome: Option<Result<GroupOutcome, ErrorCondition>>,
}

/// Handle to one member operation of a sync group.
pub struct GroupOp {
    cell: Arc<Mutex<GroupCell>>,
    name: String,
}

impl GroupOp {
    /// The channel this member operates on.
    pub fn channel_name(&self) -> &str {
        &self.name
    }

    pub fn complete(&self) -> bool {
        self.cell.lock().unwrap().outcome.is_some()
    }

    /// This member's outcome, `None` while still outstanding.
    pub fn status(&self) -> Option<Result<(), ChannelError>> {
        self.cell
            .lock()
            .unwrap()
            .outcome
            .as_ref()
            .map(|outcome| match outcome {
                Ok(_) => Ok(()),
                Err(condition) => Err((*condition).into()),
            })
    }

    /// The value a completed read delivered. `None` while outstanding, and
    /// for write members.
    pub fn value(&self) -> Option<Result<Dbr, ChannelError>> {
        self.cell
            .lock()
            .unwrap()
            .outcome
            .as_ref()
            .map(|outcome| match outcome {
                Ok(GroupOutcome::Value(dbr)) => Some(Ok(dbr.clone())),
                Ok(GroupOutcome::Acknowledged) => None,
                Err(condition) => Some(Err((*condition).into())),
            })?
    }
}

/// A batch of in-flight operations polled as a unit.
pub struct SyncGroup {
    context: Context,
    members: Vec<Arc<Mutex<GroupCell>>>,
}

impl SyncGroup {
    pub(crate) fn new(context: Context) -> Self {
        SyncGroup {
            context,
            members: Vec::new(),
        }
    }

    fn add_cell(&mut self) -> Arc<Mutex<GroupCell>> {
        let cell = Arc::new(Mutex::new(GroupCell { outcome: None }));
        self.members.push(Arc::clone(&cell));
        cell
    }

    /// Add a buffered read of `channel` to the batch.
    pub fn get(
        &mut self,
        channel: &Channel,
        req_type: Option<DbrType>,
        count: Option<usize>,
    ) -> Result<GroupOp, ChannelError> {
        let cell = self.add_cell();
        match channel.group_get(req_type, count, Arc::clone(&cell)) {
            Ok(()) => Ok(GroupOp {
                cell,
                name: channel.name(),
            }),
            Err(e) => {
                self.members.pop();
                Err(e)
            }
        }
    }

    /// Add a buffered acknowledged write of `channel` to the batch.
    pub fn put(
        &mut self,
        channel: &Channel,
        value: impl Into<DbrValue>,
        req_type: Option<DbrBasicType>,
        count: Option<usize>,
    ) -> Result<GroupOp, ChannelError> {
        let cell = self.add_cell();
        match channel.group_put(value.into(), req_type, count, Arc::clone(&cell)) {
            Ok(()) => Ok(GroupOp {
                cell,
                name: channel.name(),
            }),
            Err(e) => {
                self.members.pop();
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn all_complete(&self) -> bool {
        self.members
            .iter()
            .all(|cell| cell.lock().unwrap().outcome.is_some())
    }

    /// One non-blocking turn of the loop, then report whether every member
    /// has completed.
    pub fn test(&self) -> Result<bool, ChannelError> {
        self.context.poll()?;
        Ok(self.all_complete())
    }

    /// Wait until every member has completed, or fail with a timeout once
    /// `timeout` passes. Members still outstanding at the timeout stay in
    /// flight and may yet complete on a later pend.
    pub fn block(&self, timeout: Duration) -> Result<(), ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.test()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ErrorCondition::Timeout.into());
            }
            self.context.pend_event(utils::service_tick())?;
        }
    }

    /// Forget the current batch and start a new one. Outstanding members are
    /// detached, not cancelled.
    pub fn reset(&mut self) {
        self.members.clear();
    }
}
