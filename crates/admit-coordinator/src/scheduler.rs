//! Slot scheduler
//!
//! Pure admission policy: given the pending slots in arrival order and what
//! is already allocated, pick the slots that may start now. The caller holds
//! the slot table lock for the whole pass.

use crate::resource_group::ResourceGroupRegistry;
use crate::resource_monitor::ResourceUsageMonitor;
use admit_common::{GroupId, LogicalSlot, QueryId, QueueConfig};
use std::collections::HashMap;

/// Allocated slot counts, cluster-wide and per group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatedCounts {
    pub total: usize,
    pub per_group: HashMap<GroupId, usize>,
}

impl AllocatedCounts {
    pub fn of<'a>(allocated: impl IntoIterator<Item = &'a LogicalSlot>) -> Self {
        let mut counts = Self::default();
        for slot in allocated {
            counts.add(slot);
        }
        counts
    }

    fn add(&mut self, slot: &LogicalSlot) {
        self.total += 1;
        if let Some(group_id) = slot.group_id {
            *self.per_group.entry(group_id).or_default() += 1;
        }
    }

    pub fn in_group(&self, group_id: GroupId) -> usize {
        self.per_group.get(&group_id).copied().unwrap_or(0)
    }
}

/// Scheduler for admitting pending slots
pub struct SlotScheduler<'a> {
    config: &'a QueueConfig,
    groups: &'a ResourceGroupRegistry,
    monitor: &'a ResourceUsageMonitor,
}

impl<'a> SlotScheduler<'a> {
    pub fn new(
        config: &'a QueueConfig,
        groups: &'a ResourceGroupRegistry,
        monitor: &'a ResourceUsageMonitor,
    ) -> Self {
        Self {
            config,
            groups,
            monitor,
        }
    }

    /// Ids of the slots to allocate, in arrival order.
    ///
    /// Global limits stop the pass at the first blocked candidate. Group
    /// limits only skip the candidate, so later slots of other groups may
    /// still start.
    pub fn schedule<'s>(
        &self,
        pending: impl IntoIterator<Item = &'s LogicalSlot>,
        mut counts: AllocatedCounts,
    ) -> Vec<QueryId> {
        if self.monitor.is_global_overloaded(self.config) {
            tracing::debug!("Cluster resource usage over limit, admission paused");
            return vec![];
        }

        let global_limit = self
            .config
            .is_global_concurrency_enabled()
            .then_some(self.config.query_queue_concurrency_limit as usize);

        let mut cpu_overloaded: HashMap<GroupId, bool> = HashMap::new();
        let mut admitted = Vec::new();
        for slot in pending {
            if global_limit.is_some_and(|limit| counts.total >= limit) {
                break;
            }
            if let Some(group_id) = slot.group_id {
                if !self.group_admits(group_id, &counts, &mut cpu_overloaded) {
                    continue;
                }
            }
            counts.add(slot);
            admitted.push(slot.slot_id);
        }
        admitted
    }

    fn group_admits(
        &self,
        group_id: GroupId,
        counts: &AllocatedCounts,
        cpu_overloaded: &mut HashMap<GroupId, bool>,
    ) -> bool {
        let Some(group) = self.groups.get(group_id) else {
            return true;
        };

        if self.config.enable_group_level_query_queue {
            if let Some(limit) = group.effective_concurrency_limit() {
                if counts.in_group(group_id) >= limit {
                    return false;
                }
            }
        }

        if let Some(max_cpu_cores) = group.effective_max_cpu_cores() {
            let overloaded = *cpu_overloaded.entry(group_id).or_insert_with(|| {
                self.monitor
                    .is_group_cpu_overloaded(group_id, max_cpu_cores)
            });
            if overloaded {
                return false;
            }
        }
        true
    }
}
