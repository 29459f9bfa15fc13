//! Slot manager - leader-side admission authority
//!
//! Started when this node becomes leader and stopped when it steps down; the
//! same instance can be started again for a later term.
//!
//! All slot bookkeeping and every capacity decision happens under the table
//! mutex; RPCs to frontends are issued only after it is released.
//!
//! A background task re-runs admission whenever it is woken (new slot,
//! release, usage report) and on a periodic tick that also sweeps expired
//! slots.

use crate::cluster_state::ClusterState;
use crate::resource_group::ResourceGroupRegistry;
use crate::resource_monitor::ResourceUsageMonitor;
use crate::scheduler::{AllocatedCounts, SlotScheduler};
use admit_common::{
    now_ms, AdmitError, ConfigHandle, FinishSlotRequirementRequest, FrontendClientPool,
    FrontendId, LogicalSlot, QueryId, Result, RpcStatus, SlotState, StatusCode,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct SlotTable {
    slots: HashMap<QueryId, LogicalSlot>,
    /// Arrival order of REQUIRING slots. Ids of slots that were since
    /// allocated or removed are dropped lazily.
    pending: VecDeque<QueryId>,
}

impl SlotTable {
    fn compact_pending(&mut self) {
        let slots = &self.slots;
        self.pending.retain(|id| {
            slots
                .get(id)
                .is_some_and(|s| s.state() == SlotState::Requiring)
        });
    }

    /// Remove slots past their deadline. Returns the pending ones, which the
    /// requester has to hear about.
    fn sweep_expired(&mut self, now: i64) -> Vec<LogicalSlot> {
        let expired: Vec<QueryId> = self
            .slots
            .values()
            .filter(|s| s.is_pending_timeout(now) || s.is_allocated_expired(now))
            .map(|s| s.slot_id)
            .collect();

        let mut timed_out = Vec::new();
        for id in expired {
            let Some(mut slot) = self.slots.remove(&id) else {
                continue;
            };
            if slot.state() == SlotState::Requiring {
                tracing::warn!(
                    "Slot {} of {} pending timeout after {}s",
                    slot.slot_id,
                    slot.request_frontend,
                    slot.effective_pending_timeout_secs()
                );
                slot.on_cancel(now);
                timed_out.push(slot);
            } else {
                tracing::warn!(
                    "Slot {} of {} expired while allocated, removing",
                    slot.slot_id,
                    slot.request_frontend
                );
                slot.on_cancel(now);
            }
        }
        timed_out
    }
}

pub struct SlotManager {
    config: ConfigHandle,
    cluster: Arc<ClusterState>,
    groups: Arc<ResourceGroupRegistry>,
    monitor: Arc<ResourceUsageMonitor>,
    frontends: Arc<FrontendClientPool>,
    table: Mutex<SlotTable>,
    wakeup: Arc<Notify>,
    /// Shutdown token of the running loop, replaced on every start
    shutdown: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SlotManager {
    pub fn new(
        config: ConfigHandle,
        cluster: Arc<ClusterState>,
        groups: Arc<ResourceGroupRegistry>,
        monitor: Arc<ResourceUsageMonitor>,
        frontends: Arc<FrontendClientPool>,
    ) -> Self {
        let wakeup = Arc::new(Notify::new());
        monitor.add_listener(wakeup.clone());
        Self {
            config,
            cluster,
            groups,
            monitor,
            frontends,
            table: Mutex::new(SlotTable::default()),
            wakeup,
            shutdown: Mutex::new(CancellationToken::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn groups(&self) -> &Arc<ResourceGroupRegistry> {
        &self.groups
    }

    pub fn monitor(&self) -> &Arc<ResourceUsageMonitor> {
        &self.monitor
    }

    /// Spawn the admission loop. A manager may be started again after
    /// [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) {
        let shutdown = CancellationToken::new();
        let previous_token = std::mem::replace(&mut *self.shutdown.lock(), shutdown.clone());
        previous_token.cancel();

        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.run(shutdown).await });
        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the admission loop and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown.lock().cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Slot manager loop ended abnormally: {}", e);
            }
        }
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!("Slot manager started");
        loop {
            let interval = self.config.load().check_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            self.schedule_once().await;
        }
        tracing::info!("Slot manager stopped");
    }

    /// Register a slot for admission.
    ///
    /// Slots from unknown frontends are dropped without an error; the
    /// requester gives up through its own pending timeout.
    pub fn require_slot(&self, slot: LogicalSlot) -> Result<()> {
        let config = self.config.load();
        let frontend = &slot.request_frontend;
        let Some(known_start) = self.cluster.frontend_start_time(frontend) else {
            tracing::warn!(
                "Drop slot {} from unknown frontend {}",
                slot.slot_id,
                frontend
            );
            return Ok(());
        };
        if slot.frontend_start_time_ms < known_start {
            tracing::warn!(
                "Reject slot {}: frontend {} start time {} older than {}",
                slot.slot_id,
                frontend,
                slot.frontend_start_time_ms,
                known_start
            );
            return Err(AdmitError::stale_frontend(
                frontend.as_str(),
                slot.frontend_start_time_ms,
                known_start,
            ));
        }

        {
            let mut table = self.table.lock();
            if table.slots.contains_key(&slot.slot_id) {
                tracing::debug!("Slot {} already tracked", slot.slot_id);
                return Ok(());
            }
            if config.is_queue_capacity_limited()
                && table.slots.len() >= config.query_queue_max_queued_queries as usize
            {
                tracing::warn!(
                    "Reject slot {}: {} slots tracked, capacity {}",
                    slot.slot_id,
                    table.slots.len(),
                    config.query_queue_max_queued_queries
                );
                return Err(AdmitError::capacity_exceeded(
                    config.query_queue_max_queued_queries,
                ));
            }
            tracing::debug!("Slot {} from {} queued", slot.slot_id, frontend);
            table.pending.push_back(slot.slot_id);
            table.slots.insert(slot.slot_id, slot);
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Drop a slot in any state. Returns false if it was not tracked.
    pub fn release_slot(&self, slot_id: QueryId) -> bool {
        let removed = self.table.lock().slots.remove(&slot_id);
        match removed {
            Some(slot) => {
                tracing::debug!("Slot {} released in state {}", slot_id, slot.state());
                self.wakeup.notify_one();
                true
            }
            None => {
                tracing::debug!("Release of unknown slot {}", slot_id);
                false
            }
        }
    }

    /// Drop every slot owned by `frontend`. With `started_before`, only slots
    /// built by a process that started earlier are dropped.
    pub fn purge_frontend(&self, frontend: &FrontendId, started_before: Option<i64>) -> usize {
        let purged = {
            let mut table = self.table.lock();
            let before = table.slots.len();
            table.slots.retain(|_, slot| {
                let owned = &slot.request_frontend == frontend
                    && started_before.map_or(true, |t| slot.frontend_start_time_ms < t);
                !owned
            });
            before - table.slots.len()
        };
        if purged > 0 {
            tracing::info!("Purged {} slots of frontend {}", purged, frontend);
            self.wakeup.notify_one();
        }
        purged
    }

    /// Snapshot of every tracked slot, oldest first.
    pub fn slots(&self) -> Vec<LogicalSlot> {
        let mut slots: Vec<_> = self.table.lock().slots.values().cloned().collect();
        slots.sort_by_key(|s| (s.start_time_ms, s.slot_id.0));
        slots
    }

    pub fn get_slot(&self, slot_id: QueryId) -> Option<LogicalSlot> {
        self.table.lock().slots.get(&slot_id).cloned()
    }

    pub fn num_allocated(&self) -> usize {
        self.count_in(SlotState::Allocated)
    }

    pub fn num_pending(&self) -> usize {
        self.count_in(SlotState::Requiring)
    }

    fn count_in(&self, state: SlotState) -> usize {
        self.table
            .lock()
            .slots
            .values()
            .filter(|s| s.state() == state)
            .count()
    }

    /// One pass: sweep expired slots, admit what fits, then tell requesters.
    pub async fn schedule_once(&self) {
        let now = now_ms();
        let (timed_out, allocated) = {
            let mut table = self.table.lock();
            let timed_out = table.sweep_expired(now);
            let allocated = self.allocate_locked(&mut table, now);
            (timed_out, allocated)
        };

        let notify_timeouts = timed_out.iter().map(|slot| {
            let status = RpcStatus::error(
                StatusCode::TimedOut,
                AdmitError::pending_timeout(slot.pending_timeout_secs, slot.query_timeout_secs)
                    .to_string(),
            );
            self.finish_slot_requirement(slot, status)
        });
        for (slot, result) in timed_out
            .iter()
            .zip(futures::future::join_all(notify_timeouts).await)
        {
            if let Err(e) = result {
                tracing::warn!(
                    "Failed to notify {} of pending timeout of slot {}: {}",
                    slot.request_frontend,
                    slot.slot_id,
                    e
                );
            }
        }

        let notify_allocated = allocated
            .iter()
            .map(|slot| self.finish_slot_requirement(slot, RpcStatus::ok()));
        let mut failed = 0;
        for (slot, result) in allocated
            .iter()
            .zip(futures::future::join_all(notify_allocated).await)
        {
            if let Err(e) = result {
                tracing::warn!(
                    "Failed to notify {} of allocated slot {}, removing it: {}",
                    slot.request_frontend,
                    slot.slot_id,
                    e
                );
                self.table.lock().slots.remove(&slot.slot_id);
                failed += 1;
            }
        }
        if failed > 0 {
            self.wakeup.notify_one();
        }
    }

    fn allocate_locked(&self, table: &mut SlotTable, now: i64) -> Vec<LogicalSlot> {
        table.compact_pending();
        if table.pending.is_empty() {
            return vec![];
        }

        let config = self.config.load();
        let counts = AllocatedCounts::of(
            table
                .slots
                .values()
                .filter(|s| s.state() == SlotState::Allocated),
        );
        let admitted = SlotScheduler::new(&config, &self.groups, &self.monitor).schedule(
            table.pending.iter().filter_map(|id| table.slots.get(id)),
            counts,
        );

        let mut allocated = Vec::with_capacity(admitted.len());
        for slot_id in admitted {
            if let Some(slot) = table.slots.get_mut(&slot_id) {
                if slot.on_allocate(now) {
                    tracing::debug!(
                        "Slot {} allocated after {}ms",
                        slot_id,
                        slot.pending_time_ms(now)
                    );
                    allocated.push(slot.clone());
                }
            }
        }
        table.compact_pending();
        allocated
    }

    async fn finish_slot_requirement(&self, slot: &LogicalSlot, status: RpcStatus) -> Result<()> {
        let client = self.frontends.get_client(&slot.request_frontend)?;
        let response = client
            .finish_slot_requirement(FinishSlotRequirementRequest {
                slot_id: slot.slot_id,
                status,
            })
            .await?;
        if !response.status.is_ok() {
            return Err(AdmitError::Rpc(response.status.message()));
        }
        Ok(())
    }
}
