//! Resource usage monitor
//!
//! Keeps the latest usage report per backend together with the time it was
//! received. Admission only looks at reports that are fresh and belong to
//! backends not marked dead; everything else is treated as "no information"
//! and does not block.

use admit_common::{ConfigHandle, GroupId, GroupUsage, NodeId, QueueConfig, ResourceUsageReport};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct NodeUsage {
    report: ResourceUsageReport,
    received_at: Instant,
}

pub struct ResourceUsageMonitor {
    config: ConfigHandle,
    usages: DashMap<NodeId, NodeUsage>,
    listeners: RwLock<Vec<Arc<Notify>>>,
}

impl ResourceUsageMonitor {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            usages: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Wake `notify` whenever a report arrives or a backend dies.
    pub fn add_listener(&self, notify: Arc<Notify>) {
        self.listeners.write().push(notify);
    }

    pub fn update_resource_usage(&self, report: ResourceUsageReport) {
        tracing::debug!(
            "Resource usage from {}: cpu_permille={} mem={}/{} running={}",
            report.node_id,
            report.cpu_used_permille,
            report.mem_used_bytes,
            report.mem_limit_bytes,
            report.num_running_queries
        );
        self.usages.insert(
            report.node_id,
            NodeUsage {
                report,
                received_at: Instant::now(),
            },
        );
        self.notify_listeners();
    }

    pub fn notify_backend_dead(&self, node_id: NodeId) {
        if self.usages.remove(&node_id).is_some() {
            tracing::info!("Dropped resource usage of dead backend {}", node_id);
        }
        self.notify_listeners();
    }

    fn notify_listeners(&self) {
        for listener in self.listeners.read().iter() {
            listener.notify_one();
        }
    }

    /// Reports younger than the freshness window, sorted by node.
    pub fn fresh_reports(&self) -> Vec<ResourceUsageReport> {
        let window = self.config.load().resource_usage_interval();
        let mut reports: Vec<_> = self
            .usages
            .iter()
            .filter(|entry| entry.received_at.elapsed() <= window)
            .map(|entry| entry.report.clone())
            .collect();
        reports.sort_by_key(|r| r.node_id);
        reports
    }

    /// Whether any fresh backend is at or above the cpu or memory limit.
    pub fn is_global_overloaded(&self, config: &QueueConfig) -> bool {
        let cpu_limit = config.query_queue_cpu_used_permille_limit;
        let mem_limit = config.query_queue_mem_used_pct_limit;
        if cpu_limit <= 0 && mem_limit <= 0.0 {
            return false;
        }

        self.fresh_reports().iter().any(|report| {
            if cpu_limit > 0 && report.cpu_used_permille >= cpu_limit {
                tracing::debug!(
                    "Backend {} cpu {} permille reached limit {}",
                    report.node_id,
                    report.cpu_used_permille,
                    cpu_limit
                );
                return true;
            }
            if mem_limit > 0.0 && report.mem_limit_bytes > 0 {
                let used = report.mem_used_bytes as f64 / report.mem_limit_bytes as f64;
                if used >= mem_limit {
                    tracing::debug!(
                        "Backend {} memory {:.3} reached limit {:.3}",
                        report.node_id,
                        used,
                        mem_limit
                    );
                    return true;
                }
            }
            false
        })
    }

    /// Cpu permille used by `group`, summed over fresh backends.
    pub fn group_cpu_permille(&self, group_id: GroupId) -> i64 {
        self.fresh_reports()
            .iter()
            .flat_map(|r| r.group_usages.iter())
            .filter(|u| u.group_id == group_id)
            .map(|u| u.cpu_core_used_permille as i64)
            .sum()
    }

    pub fn is_group_cpu_overloaded(&self, group_id: GroupId, max_cpu_cores: i32) -> bool {
        self.group_cpu_permille(group_id) >= max_cpu_cores as i64 * 1000
    }

    /// Fresh per-group usage rows as `(backend, usage)`.
    pub fn group_usages(&self) -> Vec<(NodeId, GroupUsage)> {
        self.fresh_reports()
            .into_iter()
            .flat_map(|r| {
                let node_id = r.node_id;
                r.group_usages.into_iter().map(move |u| (node_id, u))
            })
            .collect()
    }
}
