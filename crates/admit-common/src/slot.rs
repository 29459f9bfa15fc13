//! Logical slot - the unit of admission
//!
//! A slot stands for one query's claim to execute. The same value is held by
//! the requesting frontend and, between registration and release, by the
//! leader's slot table. Transitions are monotonic:
//!
//! ```text
//! REQUIRING ──► ALLOCATED ──► RELEASED
//!     │             │
//!     └─────────────┴──────► CANCELLED
//! ```
//!
//! Every transition method returns `false` without touching the slot when the
//! move is not allowed from the current state.

use crate::types::{now_ms, FrontendId, GroupId, QueryId};
use serde::{Deserialize, Serialize};

pub const DEFAULT_QUERY_TIMEOUT_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Requiring,
    Allocated,
    Released,
    Cancelled,
}

impl SlotState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotState::Released | SlotState::Cancelled)
    }

    /// Label used by the running-queries view.
    pub fn query_state(&self) -> &'static str {
        match self {
            SlotState::Requiring => "PENDING",
            SlotState::Allocated => "RUNNING",
            SlotState::Released => "FINISHED",
            SlotState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlotState::Requiring => "REQUIRING",
            SlotState::Allocated => "ALLOCATED",
            SlotState::Released => "RELEASED",
            SlotState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSlot {
    pub slot_id: QueryId,
    pub request_frontend: FrontendId,
    /// Start time of the requesting frontend process, used to detect restarts.
    pub frontend_start_time_ms: i64,
    pub group_id: Option<GroupId>,
    /// Requested parallelism, used as a cpu proxy.
    pub num_slots: u32,
    pub mem_limit_bytes: i64,

    pub start_time_ms: i64,
    pub pending_timeout_secs: i64,
    pub query_timeout_secs: i64,
    pub expired_pending_time_ms: i64,
    pub expired_allocated_time_ms: i64,

    state: SlotState,
    state_changed_ms: i64,
    allocated_time_ms: Option<i64>,
}

impl LogicalSlot {
    pub fn new(
        slot_id: QueryId,
        request_frontend: FrontendId,
        frontend_start_time_ms: i64,
    ) -> Self {
        let now = now_ms();
        let mut slot = Self {
            slot_id,
            request_frontend,
            frontend_start_time_ms,
            group_id: None,
            num_slots: 1,
            mem_limit_bytes: 0,
            start_time_ms: now,
            pending_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            expired_pending_time_ms: 0,
            expired_allocated_time_ms: 0,
            state: SlotState::Requiring,
            state_changed_ms: now,
            allocated_time_ms: None,
        };
        slot.refresh_deadlines();
        slot
    }

    pub fn with_group(mut self, group_id: Option<GroupId>) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_resources(mut self, num_slots: u32, mem_limit_bytes: i64) -> Self {
        self.num_slots = num_slots.max(1);
        self.mem_limit_bytes = mem_limit_bytes;
        self
    }

    /// `start_time_ms` is when the query was submitted, not when the slot was built.
    pub fn with_timeouts(
        mut self,
        start_time_ms: i64,
        pending_timeout_secs: i64,
        query_timeout_secs: i64,
    ) -> Self {
        self.start_time_ms = start_time_ms;
        self.pending_timeout_secs = pending_timeout_secs;
        self.query_timeout_secs = query_timeout_secs;
        self.refresh_deadlines();
        self
    }

    fn refresh_deadlines(&mut self) {
        let pending_secs = self.pending_timeout_secs.min(self.query_timeout_secs).max(0);
        self.expired_pending_time_ms = self.start_time_ms + pending_secs * 1000;
        self.expired_allocated_time_ms =
            self.start_time_ms + self.query_timeout_secs.max(0) * 1000;
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn state_changed_ms(&self) -> i64 {
        self.state_changed_ms
    }

    /// Seconds bounding the pending phase, `min(pending timeout, query timeout)`.
    pub fn effective_pending_timeout_secs(&self) -> i64 {
        self.pending_timeout_secs.min(self.query_timeout_secs)
    }

    /// Time spent waiting for admission so far (or in total, once allocated).
    pub fn pending_time_ms(&self, now: i64) -> i64 {
        let end = self.allocated_time_ms.unwrap_or(now);
        (end - self.start_time_ms).max(0)
    }

    /// Whole execution allowance: time spent pending plus the query timeout.
    pub fn exec_timeout_secs(&self) -> i64 {
        let pending_secs = self.pending_time_ms(now_ms()) / 1000;
        pending_secs + self.query_timeout_secs
    }

    pub fn is_pending_timeout(&self, now: i64) -> bool {
        self.state == SlotState::Requiring && now >= self.expired_pending_time_ms
    }

    pub fn is_allocated_expired(&self, now: i64) -> bool {
        self.state == SlotState::Allocated && now >= self.expired_allocated_time_ms
    }

    /// REQUIRING -> ALLOCATED. The allocated deadline restarts the query
    /// timeout from the allocation time, so queue wait is not charged twice.
    pub fn on_allocate(&mut self, now: i64) -> bool {
        if self.state != SlotState::Requiring {
            return false;
        }
        self.allocated_time_ms = Some(now);
        self.expired_allocated_time_ms = now + self.query_timeout_secs.max(0) * 1000;
        self.transit(SlotState::Allocated, now);
        true
    }

    /// ALLOCATED -> RELEASED.
    pub fn on_release(&mut self, now: i64) -> bool {
        if self.state != SlotState::Allocated {
            return false;
        }
        self.transit(SlotState::Released, now);
        true
    }

    /// REQUIRING -> RELEASED, used only when the leader does not know the
    /// slot protocol and the query runs without queueing.
    pub fn on_skip_queue(&mut self, now: i64) -> bool {
        if self.state != SlotState::Requiring {
            return false;
        }
        self.transit(SlotState::Released, now);
        true
    }

    /// REQUIRING | ALLOCATED -> CANCELLED.
    pub fn on_cancel(&mut self, now: i64) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.transit(SlotState::Cancelled, now);
        true
    }

    fn transit(&mut self, to: SlotState, now: i64) {
        tracing::debug!("Slot {} {} -> {}", self.slot_id, self.state, to);
        self.state = to;
        self.state_changed_ms = now;
    }
}
