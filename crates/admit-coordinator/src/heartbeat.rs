//! Heartbeat routing on the leader.
//!
//! Liveness results come from the embedding system's heartbeat checker; this
//! handler fans them out to cluster state, the usage monitor and the slot
//! manager.

use std::sync::Arc;

use admit_common::{ConfigHandle, FrontendId, NodeId, ResourceUsageReport};

use crate::cluster_state::FrontendEvent;
use crate::slot_manager::SlotManager;

pub struct HeartbeatHandler {
    config: ConfigHandle,
    manager: Arc<SlotManager>,
}

impl HeartbeatHandler {
    pub fn new(config: ConfigHandle, manager: Arc<SlotManager>) -> Self {
        Self { config, manager }
    }

    pub fn frontend_heartbeat(&self, frontend: &FrontendId, start_time_ms: i64) {
        let event = self
            .manager
            .cluster()
            .handle_frontend_heartbeat(frontend, start_time_ms);
        self.apply(frontend, event);
    }

    pub fn frontend_heartbeat_failed(&self, frontend: &FrontendId) {
        let retry_times = self.config.load().heartbeat_retry_times;
        let event = self
            .manager
            .cluster()
            .handle_frontend_heartbeat_failure(frontend, retry_times);
        self.apply(frontend, event);
    }

    fn apply(&self, frontend: &FrontendId, event: Option<FrontendEvent>) {
        match event {
            Some(FrontendEvent::Restarted { start_time_ms }) => {
                self.manager.purge_frontend(frontend, Some(start_time_ms));
            }
            Some(FrontendEvent::Dead) => {
                self.manager.purge_frontend(frontend, None);
            }
            None => {}
        }
    }

    /// A backend heartbeat carrying its latest resource usage.
    pub fn backend_heartbeat(&self, report: ResourceUsageReport) {
        self.manager.cluster().handle_backend_heartbeat(report.node_id);
        self.manager.monitor().update_resource_usage(report);
    }

    pub fn backend_dead(&self, node_id: NodeId) {
        if self.manager.cluster().mark_backend_dead(node_id) {
            tracing::warn!("Backend {} is dead", node_id);
        }
        self.manager.monitor().notify_backend_dead(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot_manager::tests::{manager, slot_from};
    use admit_common::QueueConfig;

    #[test]
    fn test_restart_purges_old_slots_only() {
        let (manager, _) = manager(QueueConfig::default());
        let handler = HeartbeatHandler::new(ConfigHandle::default(), manager.clone());
        let fe = FrontendId::new("fe-1");

        manager.require_slot(slot_from("fe-1", 100)).unwrap();
        handler.frontend_heartbeat(&fe, 100);
        assert_eq!(manager.slots().len(), 1);

        handler.frontend_heartbeat(&fe, 200);
        assert!(manager.slots().is_empty());
        manager.require_slot(slot_from("fe-1", 200)).unwrap();
        assert_eq!(manager.slots().len(), 1);
    }

    #[test]
    fn test_dead_frontend_purged_after_retries() {
        let (manager, _) = manager(QueueConfig::default());
        let handler = HeartbeatHandler::new(
            ConfigHandle::new(QueueConfig {
                heartbeat_retry_times: 1,
                ..Default::default()
            }),
            manager.clone(),
        );
        let fe = FrontendId::new("fe-1");
        manager.require_slot(slot_from("fe-1", 100)).unwrap();

        handler.frontend_heartbeat_failed(&fe);
        assert_eq!(manager.slots().len(), 1);
        handler.frontend_heartbeat_failed(&fe);
        assert!(manager.slots().is_empty());

        // Dead frontends are unknown until they heartbeat again.
        manager.require_slot(slot_from("fe-1", 100)).unwrap();
        assert!(manager.slots().is_empty());
    }

    #[test]
    fn test_backend_death_clears_usage() {
        let (manager, _) = manager(QueueConfig::default());
        let handler = HeartbeatHandler::new(ConfigHandle::default(), manager.clone());
        handler.backend_heartbeat(ResourceUsageReport::new(NodeId(3)).with_cpu(10));
        assert!(manager.cluster().is_backend_alive(NodeId(3)));
        assert_eq!(manager.monitor().fresh_reports().len(), 1);

        handler.backend_dead(NodeId(3));
        assert!(!manager.cluster().is_backend_alive(NodeId(3)));
        assert!(manager.monitor().fresh_reports().is_empty());
    }
}
