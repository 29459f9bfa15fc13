//! In-process cluster driving a synthetic workload through the query queue.
//!
//! One frontend doubles as the leader: its `SlotManager` schedules, its
//! `QueryQueueManager` submits, and both talk through the client pools
//! exactly as remote nodes would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use admit_common::{
    now_ms, ConfigHandle, FrontendClientPool, FrontendId, GroupId, GroupUsage, LeaderTracker,
    NodeId, QueryClass, QueryId, ResourceUsageReport, SlotClientPool, SlotState,
};
use admit_coordinator::views::{
    render_running_queries, render_usage_resource_groups, show_running_queries,
    show_usage_resource_groups,
};
use admit_coordinator::{
    ClusterState, HeartbeatHandler, ResourceGroup, ResourceGroupRegistry, ResourceUsageMonitor,
    SlotManager, SlotServiceImpl,
};
use admit_frontend::{
    FrontendServiceImpl, PlanNodeKind, PlanSummary, QueryContext, QueryJob, QueryQueueManager,
};
use tokio::task::JoinSet;

use crate::config::ServerConfig;

/// Nominal cpu a running query costs a backend, in permille.
const QUERY_CPU_PERMILLE: i32 = 250;
const QUERY_MEM_BYTES: i64 = 64 << 20;
const BACKEND_MEM_BYTES: i64 = 8 << 30;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkloadSummary {
    pub admitted: usize,
    pub rejected: usize,
    pub max_running: usize,
}

pub struct Simulation {
    config: ServerConfig,
    leader: Arc<SlotManager>,
    frontend: Arc<QueryQueueManager>,
    heartbeat: HeartbeatHandler,
}

impl Simulation {
    pub fn new(config: ServerConfig) -> Self {
        let queue = ConfigHandle::new(config.queue.clone());
        let self_id = FrontendId::new(config.frontend.as_str());
        let start_time_ms = now_ms();

        let cluster = Arc::new(ClusterState::new());
        cluster.register_frontend(self_id.clone(), start_time_ms);

        let groups = Arc::new(ResourceGroupRegistry::new());
        for group in &config.groups {
            groups.upsert(
                ResourceGroup::new(group.id, group.name.as_str())
                    .with_concurrency_limit(group.concurrency_limit)
                    .with_max_cpu_cores(group.max_cpu_cores),
            );
        }

        let monitor = Arc::new(ResourceUsageMonitor::new(queue.clone()));
        let slot_clients = Arc::new(SlotClientPool::new());
        let frontend_clients = Arc::new(FrontendClientPool::new());
        let leader_tracker = LeaderTracker::new(Some(self_id.clone()));

        let leader = Arc::new(SlotManager::new(
            queue.clone(),
            cluster,
            groups,
            monitor,
            frontend_clients.clone(),
        ));
        slot_clients.register(
            self_id.clone(),
            Arc::new(SlotServiceImpl::new(
                self_id.clone(),
                leader_tracker.clone(),
                leader.clone(),
            )),
        );

        let frontend = Arc::new(QueryQueueManager::new(
            self_id.clone(),
            start_time_ms,
            queue.clone(),
            leader_tracker,
            slot_clients,
        ));
        frontend_clients.register(self_id, Arc::new(FrontendServiceImpl::new(frontend.clone())));

        let heartbeat = HeartbeatHandler::new(queue, leader.clone());
        Self {
            config,
            leader,
            frontend,
            heartbeat,
        }
    }

    pub fn leader(&self) -> &Arc<SlotManager> {
        &self.leader
    }

    /// Submit the whole workload, wait for every query to resolve and print
    /// the running-query view along the way.
    pub async fn run(&self) -> WorkloadSummary {
        self.leader.start();
        self.report_usage();

        let workload = &self.config.workload;
        let mut queries = JoinSet::new();
        for i in 0..workload.queries {
            let frontend = self.frontend.clone();
            let ctx = self.query_context(i);
            let hold = Duration::from_millis(workload.hold_ms);
            queries.spawn(async move {
                let job = QueryJob::new(
                    QueryId::new(),
                    PlanSummary::new(vec![PlanNodeKind::OlapScan, PlanNodeKind::Other]),
                );
                let result = frontend.maybe_wait(&ctx, &job).await;
                match &result {
                    Ok(()) => {
                        tracing::debug!("Query {} admitted", job.query_id());
                        tokio::time::sleep(hold).await;
                        frontend.on_finished(&job).await;
                    }
                    Err(e) => tracing::warn!("Query {} not admitted: {}", job.query_id(), e),
                }
                result.is_ok()
            });
        }

        let mut summary = WorkloadSummary::default();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(workload.snapshot_interval_ms.max(10)));
        loop {
            tokio::select! {
                joined = queries.join_next() => match joined {
                    Some(Ok(true)) => summary.admitted += 1,
                    Some(Ok(false)) => summary.rejected += 1,
                    Some(Err(e)) => {
                        tracing::error!("Query task failed: {}", e);
                        summary.rejected += 1;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let rows = show_running_queries(&self.leader, None);
                    let running = rows.iter().filter(|r| !r.is_pending()).count();
                    summary.max_running = summary.max_running.max(running);
                    println!("{}", render_running_queries(&rows));
                    self.report_usage();
                    let usage = show_usage_resource_groups(&self.leader);
                    println!("{}", render_usage_resource_groups(&usage));
                }
            }
        }

        self.leader.stop().await;
        tracing::info!(
            "Workload finished: {} admitted, {} rejected, at most {} running",
            summary.admitted,
            summary.rejected,
            summary.max_running
        );
        summary
    }

    fn query_context(&self, i: usize) -> QueryContext {
        let group = if self.config.groups.is_empty() {
            None
        } else {
            Some(GroupId(self.config.groups[i % self.config.groups.len()].id))
        };
        QueryContext::new(QueryClass::Select)
            .with_query_timeout(self.config.workload.query_timeout_secs)
            .with_group(group)
            .with_resources(1, QUERY_MEM_BYTES)
    }

    /// Spread the allocated slots over the backends and report them as if
    /// each backend had heartbeated.
    fn report_usage(&self) {
        let backends = self.config.workload.backends;
        if backends == 0 {
            return;
        }

        let mut per_backend: Vec<HashMap<GroupId, i32>> = vec![HashMap::new(); backends as usize];
        let allocated = self
            .leader
            .slots()
            .into_iter()
            .filter(|slot| slot.state() == SlotState::Allocated);
        for (i, slot) in allocated.enumerate() {
            let group = slot.group_id.unwrap_or(GroupId(0));
            *per_backend[i % backends as usize].entry(group).or_default() += 1;
        }

        for (i, groups) in per_backend.into_iter().enumerate() {
            let running: i32 = groups.values().sum();
            let group_usages = self
                .config
                .groups
                .iter()
                .map(|g| {
                    let queries = groups.get(&GroupId(g.id)).copied().unwrap_or(0);
                    GroupUsage {
                        group_id: GroupId(g.id),
                        cpu_core_used_permille: queries * QUERY_CPU_PERMILLE,
                        mem_used_bytes: i64::from(queries) * QUERY_MEM_BYTES,
                        num_running_queries: queries,
                    }
                })
                .collect();
            let mut report = ResourceUsageReport::new(NodeId(i as u32 + 1))
                .with_cpu(running * QUERY_CPU_PERMILLE)
                .with_mem(i64::from(running) * QUERY_MEM_BYTES, BACKEND_MEM_BYTES)
                .with_groups(group_usages);
            report.num_running_queries = running;
            self.heartbeat.backend_heartbeat(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;

    fn small_workload(queries: usize) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.queue.slot_manager_check_interval_ms = 20;
        config.workload.queries = queries;
        config.workload.hold_ms = 50;
        config.workload.snapshot_interval_ms = 10;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workload_respects_concurrency_limit() {
        let mut config = small_workload(6);
        config.queue.query_queue_concurrency_limit = 2;

        let simulation = Simulation::new(config);
        let summary = simulation.run().await;
        assert_eq!(summary.admitted, 6);
        assert_eq!(summary.rejected, 0);
        assert!(summary.max_running <= 2);
        assert!(simulation.leader().slots().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overflowing_queries_rejected() {
        let mut config = small_workload(5);
        config.queue.query_queue_concurrency_limit = 1;
        config.queue.query_queue_max_queued_queries = 3;
        config.workload.hold_ms = 300;

        let summary = Simulation::new(config).run().await;
        assert_eq!(summary.admitted + summary.rejected, 5);
        assert!(summary.rejected >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_groups_share_the_workload() {
        let mut config = small_workload(4);
        config.queue.query_queue_concurrency_limit = 0;
        config.queue.enable_group_level_query_queue = true;
        config.groups = vec![
            GroupConfig {
                id: 1,
                name: "etl".to_string(),
                concurrency_limit: 1,
                max_cpu_cores: 0,
            },
            GroupConfig {
                id: 2,
                name: "adhoc".to_string(),
                concurrency_limit: 1,
                max_cpu_cores: 0,
            },
        ];

        let summary = Simulation::new(config).run().await;
        assert_eq!(summary.admitted, 4);
        assert!(summary.max_running <= 2);
    }
}
