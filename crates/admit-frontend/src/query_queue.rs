//! Query queue manager
//!
//! Runs on every query-accepting frontend. Decides whether a query has to
//! queue, registers its slot with the leader and parks the caller until the
//! slot is allocated, cancelled or times out.

use std::sync::Arc;
use std::time::Duration;

use admit_common::{
    now_ms, AdmitError, ConfigHandle, FrontendId, LeaderTracker, LogicalSlot, QueryId,
    QueueConfig, ReleaseSlotRequest, RequireSlotRequest, Result, RpcStatus, SlotClientPool,
    SlotState, StatusCode,
};
use dashmap::DashMap;

use crate::job::{QueryContext, QueryJob};
use crate::requirement::SlotRequirement;

/// How a require call was answered.
enum RequireOutcome {
    Queued,
    /// The leader predates the slot protocol; run without queueing.
    LegacyLeader,
}

pub struct QueryQueueManager {
    self_id: FrontendId,
    start_time_ms: i64,
    config: ConfigHandle,
    leader: LeaderTracker,
    leaders: Arc<SlotClientPool>,
    requirements: DashMap<QueryId, Arc<SlotRequirement>>,
}

impl QueryQueueManager {
    pub fn new(
        self_id: FrontendId,
        start_time_ms: i64,
        config: ConfigHandle,
        leader: LeaderTracker,
        leaders: Arc<SlotClientPool>,
    ) -> Self {
        Self {
            self_id,
            start_time_ms,
            config,
            leader,
            leaders,
            requirements: DashMap::new(),
        }
    }

    pub fn self_id(&self) -> &FrontendId {
        &self.self_id
    }

    pub fn start_time_ms(&self) -> i64 {
        self.start_time_ms
    }

    pub fn requirement(&self, slot_id: QueryId) -> Option<Arc<SlotRequirement>> {
        self.requirements.get(&slot_id).map(|r| r.value().clone())
    }

    /// Slots this frontend still tracks (waiting or running).
    pub fn num_tracked(&self) -> usize {
        self.requirements.len()
    }

    pub fn num_pending(&self) -> usize {
        self.requirements
            .iter()
            .filter(|r| r.state() == SlotState::Requiring)
            .count()
    }

    pub fn need_queue(config: &QueueConfig, ctx: &QueryContext, job: &QueryJob) -> bool {
        ctx.need_queued
            && config.is_queue_enabled(ctx.effective_class())
            && job.plan().has_data_scan()
    }

    /// Block until the query may run.
    ///
    /// Returns immediately for queries that do not queue. On error the slot
    /// is already cancelled locally and dropped on the leader.
    pub async fn maybe_wait(&self, ctx: &QueryContext, job: &QueryJob) -> Result<()> {
        let config = self.config.load();
        if !Self::need_queue(&config, ctx, job) {
            return Ok(());
        }

        let slot = LogicalSlot::new(job.query_id(), self.self_id.clone(), self.start_time_ms)
            .with_group(ctx.group_id)
            .with_resources(ctx.num_slots, ctx.mem_limit_bytes)
            .with_timeouts(
                ctx.start_time_ms,
                config.query_queue_pending_timeout_second as i64,
                ctx.query_timeout_secs,
            );
        let requirement = Arc::new(SlotRequirement::new(slot));
        job.set_requirement(requirement.clone());

        let now = now_ms();
        let slot = requirement.snapshot();
        if slot.is_pending_timeout(now) {
            let err =
                AdmitError::pending_timeout(slot.pending_timeout_secs, slot.query_timeout_secs);
            requirement.on_cancelled(err.clone(), now);
            return Err(err);
        }

        self.requirements.insert(requirement.slot_id(), requirement.clone());
        let result = self.wait_for_slot(&requirement, job).await;
        if result.is_err() || requirement.state() != SlotState::Allocated {
            self.requirements.remove(&requirement.slot_id());
        }
        result
    }

    async fn wait_for_slot(&self, requirement: &SlotRequirement, job: &QueryJob) -> Result<()> {
        let mut leader_rx = self.leader.subscribe();
        let mut watch_leader = true;

        if let Some(result) = self.send_require(requirement).await {
            return result;
        }

        let mut state_rx = requirement.subscribe();
        let slot = requirement.snapshot();
        let wait_ms = (slot.expired_pending_time_ms - now_ms()).max(0) as u64;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);

        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                SlotState::Allocated | SlotState::Released => return Ok(()),
                SlotState::Cancelled => {
                    return Err(requirement
                        .cause()
                        .unwrap_or_else(|| AdmitError::Cancelled(job.cancel_reason())))
                }
                SlotState::Requiring => {}
            }

            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(AdmitError::Internal(format!(
                            "slot {} state channel closed",
                            requirement.slot_id()
                        )));
                    }
                }
                _ = job.cancel_token().cancelled() => {
                    let err = AdmitError::Cancelled(job.cancel_reason());
                    if requirement.on_cancelled(err, now_ms()) {
                        tracing::info!("Query {} cancelled while pending", job.query_id());
                        self.release_on_leader(requirement).await;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // An allocation that raced the timer wins.
                    let err = AdmitError::pending_timeout(
                        slot.pending_timeout_secs,
                        slot.query_timeout_secs,
                    );
                    if requirement.on_cancelled(err, now_ms()) {
                        tracing::warn!(
                            "Query {} pending timeout after {}s",
                            job.query_id(),
                            slot.effective_pending_timeout_secs()
                        );
                        self.release_on_leader(requirement).await;
                    }
                }
                changed = leader_rx.changed(), if watch_leader => {
                    if changed.is_err() {
                        watch_leader = false;
                        continue;
                    }
                    let leader = leader_rx.borrow_and_update().clone();
                    if leader.is_some()
                        && leader != requirement.sent_to()
                        && requirement.state() == SlotState::Requiring
                    {
                        tracing::info!(
                            "Leader changed, re-sending slot {} to {:?}",
                            requirement.slot_id(),
                            leader
                        );
                        if let Some(result) = self.send_require(requirement).await {
                            return result;
                        }
                    }
                }
            }
        }
    }

    /// Send the slot to the current leader. `None` means the slot is queued
    /// and the caller should wait; `Some` is a final answer.
    async fn send_require(&self, requirement: &SlotRequirement) -> Option<Result<()>> {
        match self.require_on_leader(requirement).await {
            Ok(RequireOutcome::Queued) => None,
            Ok(RequireOutcome::LegacyLeader) => {
                requirement.on_released(now_ms());
                Some(Ok(()))
            }
            Err(e) => {
                tracing::warn!("Failed to require slot {}: {}", requirement.slot_id(), e);
                if requirement.on_cancelled(e.clone(), now_ms()) {
                    Some(Err(e))
                } else {
                    // Resolved concurrently, e.g. allocated by a push that beat the reply.
                    None
                }
            }
        }
    }

    async fn require_on_leader(&self, requirement: &SlotRequirement) -> Result<RequireOutcome> {
        let leader = self
            .leader
            .leader()
            .ok_or_else(|| AdmitError::Rpc("no leader available".to_string()))?;
        let client = self.leaders.get_client(&leader)?;
        requirement.set_sent_to(leader.clone());

        let request = RequireSlotRequest {
            slot: requirement.snapshot(),
        };
        match client.require_slot_async(request).await {
            Ok(_) => Ok(RequireOutcome::Queued),
            Err(status) if AdmitError::is_unknown_method(&status) => {
                tracing::warn!(
                    "Leader {} does not support slot requests, running slot {} without queueing",
                    leader,
                    requirement.slot_id()
                );
                Ok(RequireOutcome::LegacyLeader)
            }
            Err(status) => Err(status.into()),
        }
    }

    /// Best-effort release on the current leader. Failures are logged; the
    /// leader's expiry sweep reclaims anything left behind.
    async fn release_on_leader(&self, requirement: &SlotRequirement) {
        let slot_id = requirement.slot_id();
        let Some(leader) = self.leader.leader() else {
            tracing::warn!("No leader to release slot {}", slot_id);
            return;
        };
        let client = match self.leaders.get_client(&leader) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("Failed to release slot {}: {}", slot_id, e);
                return;
            }
        };
        match client.release_slot(ReleaseSlotRequest { slot_id }).await {
            Ok(response) if response.status.is_ok() => {
                tracing::debug!("Released slot {} on {}", slot_id, leader);
            }
            Ok(response) => {
                tracing::debug!(
                    "Leader {} did not release slot {}: {}",
                    leader,
                    slot_id,
                    response.status.message()
                );
            }
            Err(status) if AdmitError::is_unknown_method(&status) => {}
            Err(status) => {
                tracing::warn!(
                    "Failed to release slot {} on {}: {}",
                    slot_id,
                    leader,
                    status.message()
                );
            }
        }
    }

    /// Called once the query has finished, successfully or not.
    pub async fn on_finished(&self, job: &QueryJob) {
        let Some(requirement) = job.requirement() else {
            return;
        };
        self.requirements.remove(&requirement.slot_id());
        if requirement.state() == SlotState::Allocated && requirement.on_released(now_ms()) {
            self.release_on_leader(&requirement).await;
        }
    }

    /// Cancel a query. A waiting caller is woken with `Cancelled`; a running
    /// query gives its slot back.
    pub async fn cancel(&self, job: &QueryJob, reason: &str) {
        job.cancel(reason);
        let Some(requirement) = job.requirement() else {
            return;
        };
        if requirement.state() == SlotState::Allocated
            && requirement.on_cancelled(AdmitError::Cancelled(job.cancel_reason()), now_ms())
        {
            self.requirements.remove(&requirement.slot_id());
            self.release_on_leader(&requirement).await;
        }
    }

    /// Leader push: the slot was allocated (OK) or dropped by the leader.
    ///
    /// Any answer other than OK makes the leader discard its copy.
    pub fn on_finish_slot_requirement(&self, slot_id: QueryId, status: RpcStatus) -> RpcStatus {
        let Some(requirement) = self.requirement(slot_id) else {
            tracing::warn!("Finish for unknown slot {}", slot_id);
            return RpcStatus::error(StatusCode::NotFound, format!("slot {} not found", slot_id));
        };

        let now = now_ms();
        if status.is_ok() {
            if requirement.on_allocated(now) {
                tracing::debug!("Slot {} allocated", slot_id);
                return RpcStatus::ok();
            }
            return RpcStatus::error(
                StatusCode::InternalError,
                format!("slot {} is {}", slot_id, requirement.state()),
            );
        }

        if requirement.on_cancelled(status.to_error(), now) {
            tracing::warn!("Slot {} dropped by leader: {}", slot_id, status.message());
        }
        RpcStatus::ok()
    }
}
