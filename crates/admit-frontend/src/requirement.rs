//! Per-slot waiter state on the requesting frontend
//!
//! Wraps the local copy of a [`LogicalSlot`] with a `watch` channel. The
//! channel is written only after a transition succeeds, so every waiter sees
//! exactly one terminal value no matter how many sources race to resolve the
//! slot.

use admit_common::{AdmitError, FrontendId, LogicalSlot, QueryId, SlotState};
use parking_lot::Mutex;
use tokio::sync::watch;

struct Inner {
    slot: LogicalSlot,
    cause: Option<AdmitError>,
    /// Leader the slot was last sent to
    sent_to: Option<FrontendId>,
}

pub struct SlotRequirement {
    slot_id: QueryId,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SlotState>,
}

impl SlotRequirement {
    pub fn new(slot: LogicalSlot) -> Self {
        let (state_tx, _) = watch::channel(slot.state());
        Self {
            slot_id: slot.slot_id,
            inner: Mutex::new(Inner {
                slot,
                cause: None,
                sent_to: None,
            }),
            state_tx,
        }
    }

    pub fn slot_id(&self) -> QueryId {
        self.slot_id
    }

    pub fn snapshot(&self) -> LogicalSlot {
        self.inner.lock().slot.clone()
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().slot.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SlotState> {
        self.state_tx.subscribe()
    }

    /// Why the slot was cancelled, if it was.
    pub fn cause(&self) -> Option<AdmitError> {
        self.inner.lock().cause.clone()
    }

    pub fn sent_to(&self) -> Option<FrontendId> {
        self.inner.lock().sent_to.clone()
    }

    pub(crate) fn set_sent_to(&self, leader: FrontendId) {
        self.inner.lock().sent_to = Some(leader);
    }

    pub fn on_allocated(&self, now: i64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.slot.on_allocate(now) {
            return false;
        }
        self.state_tx.send_replace(SlotState::Allocated);
        true
    }

    /// ALLOCATED -> RELEASED, or REQUIRING -> RELEASED when the query runs
    /// without queueing.
    pub fn on_released(&self, now: i64) -> bool {
        let mut inner = self.inner.lock();
        let released = match inner.slot.state() {
            SlotState::Requiring => inner.slot.on_skip_queue(now),
            _ => inner.slot.on_release(now),
        };
        if released {
            self.state_tx.send_replace(SlotState::Released);
        }
        released
    }

    pub fn on_cancelled(&self, cause: AdmitError, now: i64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.slot.on_cancel(now) {
            return false;
        }
        inner.cause = Some(cause);
        self.state_tx.send_replace(SlotState::Cancelled);
        true
    }
}
