//! Read-only admin projections of the leader's state.

use crate::slot_manager::SlotManager;
use admit_common::{GroupId, NodeId, QueryId, SlotState};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct RunningQueryRow {
    pub query_id: QueryId,
    pub resource_group: String,
    pub start_time_ms: i64,
    pub pending_timeout_ms: i64,
    pub query_timeout_ms: i64,
    pub state: &'static str,
    /// When the slot entered its current state
    pub state_since_ms: i64,
    pub slots: u32,
    pub mem_limit_bytes: i64,
    pub frontend: String,
}

impl RunningQueryRow {
    pub fn is_pending(&self) -> bool {
        self.state == SlotState::Requiring.query_state()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupUsageRow {
    pub name: String,
    pub id: GroupId,
    pub backend: NodeId,
    pub cpu_cores: f64,
    pub mem_bytes: i64,
    pub running_queries: i32,
}

/// Tracked slots, oldest first. `limit` of `None` returns all of them.
pub fn show_running_queries(manager: &SlotManager, limit: Option<usize>) -> Vec<RunningQueryRow> {
    let groups = manager.groups();
    manager
        .slots()
        .into_iter()
        .filter(|slot| !slot.state().is_terminal())
        .take(limit.unwrap_or(usize::MAX))
        .map(|slot| RunningQueryRow {
            query_id: slot.slot_id,
            resource_group: slot
                .group_id
                .map(|id| groups.name_of(id).unwrap_or_else(|| id.to_string()))
                .unwrap_or_else(|| "-".to_string()),
            start_time_ms: slot.start_time_ms,
            pending_timeout_ms: slot.expired_pending_time_ms,
            query_timeout_ms: slot.expired_allocated_time_ms,
            state: slot.state().query_state(),
            state_since_ms: slot.state_changed_ms(),
            slots: slot.num_slots,
            mem_limit_bytes: slot.mem_limit_bytes,
            frontend: slot.request_frontend.to_string(),
        })
        .collect()
}

/// One row per (group, backend) pair found in fresh usage reports, sorted by
/// group id then backend. Groups the registry does not know are skipped.
pub fn show_usage_resource_groups(manager: &SlotManager) -> Vec<GroupUsageRow> {
    let groups = manager.groups();
    let cluster = manager.cluster();
    let mut rows: Vec<_> = manager
        .monitor()
        .group_usages()
        .into_iter()
        .filter(|(node_id, _)| cluster.is_backend_alive(*node_id))
        .filter_map(|(node_id, usage)| {
            let name = groups.name_of(usage.group_id)?;
            Some(GroupUsageRow {
                name,
                id: usage.group_id,
                backend: node_id,
                cpu_cores: usage.cpu_core_used_permille as f64 / 1000.0,
                mem_bytes: usage.mem_used_bytes,
                running_queries: usage.num_running_queries,
            })
        })
        .collect();
    rows.sort_by_key(|r| (r.id, r.backend));
    rows
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

pub fn render_running_queries(rows: &[RunningQueryRow]) -> String {
    let mut out = String::from(
        "QueryId|ResourceGroup|StartTime|PendingTimeout|QueryTimeout|State|StateSince|Slots|\
         MemLimitBytes|Frontend\n",
    );
    for r in rows {
        out.push_str(&format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}\n",
            r.query_id,
            r.resource_group,
            format_ms(r.start_time_ms),
            format_ms(r.pending_timeout_ms),
            format_ms(r.query_timeout_ms),
            r.state,
            format_ms(r.state_since_ms),
            r.slots,
            r.mem_limit_bytes,
            r.frontend
        ));
    }
    out
}

pub fn render_usage_resource_groups(rows: &[GroupUsageRow]) -> String {
    let mut out =
        String::from("Name|Id|Backend|BEInUseCpuCores|BEInUseMemBytes|BERunningQueries\n");
    for r in rows {
        out.push_str(&format!(
            "{}|{}|{}|{}|{}|{}\n",
            r.name, r.id, r.backend.0, r.cpu_cores, r.mem_bytes, r.running_queries
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::HeartbeatHandler;
    use crate::resource_group::ResourceGroup;
    use crate::slot_manager::tests::{manager, slot_from};
    use admit_common::{now_ms, ConfigHandle, GroupUsage, QueueConfig, ResourceUsageReport};

    fn usage(group: i64, cpu: i32, mem: i64, running: i32) -> GroupUsage {
        GroupUsage {
            group_id: GroupId(group),
            cpu_core_used_permille: cpu,
            mem_used_bytes: mem,
            num_running_queries: running,
        }
    }

    #[tokio::test]
    async fn test_show_running_queries() {
        let (manager, _) = manager(QueueConfig {
            query_queue_concurrency_limit: 1,
            ..Default::default()
        });
        manager.groups().upsert(ResourceGroup::new(7, "wg7"));
        let base = now_ms();
        manager
            .require_slot(slot_from("fe-1", 100).with_timeouts(base, 300, 300))
            .unwrap();
        manager
            .require_slot(
                slot_from("fe-1", 100)
                    .with_group(Some(GroupId(7)))
                    .with_timeouts(base + 1, 300, 300),
            )
            .unwrap();
        manager.schedule_once().await;

        let rows = show_running_queries(&manager, None);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].resource_group, "-");
        assert_eq!(rows[0].state, "RUNNING");
        assert_eq!(rows[1].resource_group, "wg7");
        assert_eq!(rows[1].state, "PENDING");
        assert!(rows[1].is_pending());
        assert_eq!(rows[1].pending_timeout_ms, base + 1 + 300_000);
        assert!(rows[0].state_since_ms >= base);
        assert_eq!(show_running_queries(&manager, Some(1)).len(), 1);

        let text = render_running_queries(&rows);
        assert_eq!(text.lines().count(), 3);
        assert_eq!(
            text.lines().next().unwrap(),
            "QueryId|ResourceGroup|StartTime|PendingTimeout|QueryTimeout|State|StateSince|Slots|\
             MemLimitBytes|Frontend"
        );
        assert!(text.lines().nth(2).unwrap().contains("|wg7|"));
    }

    #[test]
    fn test_show_usage_resource_groups() {
        let (manager, _) = manager(QueueConfig::default());
        let heartbeat = HeartbeatHandler::new(ConfigHandle::default(), manager.clone());
        manager.groups().upsert(ResourceGroup::new(1, "rg1"));
        manager.groups().upsert(ResourceGroup::new(2, "rg2"));
        for node in [2, 1] {
            heartbeat.backend_heartbeat(ResourceUsageReport::new(NodeId(node)).with_groups(vec![
                usage(2, 1500, 20, 2),
                usage(1, 250, 10, 1),
                usage(99, 10, 1, 1),
            ]));
        }
        heartbeat.backend_dead(NodeId(2));

        let rows = show_usage_resource_groups(&manager);
        let keys: Vec<_> = rows.iter().map(|r| (r.id.0, r.backend.0)).collect();
        assert_eq!(keys, vec![(1, 1), (2, 1)]);

        let text = render_usage_resource_groups(&rows);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Name|Id|Backend|BEInUseCpuCores|BEInUseMemBytes|BERunningQueries"
        );
        assert_eq!(lines[1], "rg1|1|1|0.25|10|1");
        assert_eq!(lines[2], "rg2|2|1|1.5|20|2");
    }

    #[test]
    fn test_dead_backend_leaves_view_and_admission_together() {
        let config = QueueConfig {
            query_queue_mem_used_pct_limit: 0.8,
            ..Default::default()
        };
        let (manager, _) = manager(config.clone());
        let heartbeat = HeartbeatHandler::new(ConfigHandle::new(config.clone()), manager.clone());
        manager.groups().upsert(ResourceGroup::new(1, "rg1"));
        heartbeat.backend_heartbeat(
            ResourceUsageReport::new(NodeId(4))
                .with_mem(95, 100)
                .with_groups(vec![usage(1, 100, 95, 1)]),
        );
        assert!(manager.monitor().is_global_overloaded(&config));
        assert_eq!(show_usage_resource_groups(&manager).len(), 1);

        heartbeat.backend_dead(NodeId(4));
        assert!(!manager.cluster().is_backend_alive(NodeId(4)));
        assert!(!manager.monitor().is_global_overloaded(&config));
        assert!(show_usage_resource_groups(&manager).is_empty());
    }
}
