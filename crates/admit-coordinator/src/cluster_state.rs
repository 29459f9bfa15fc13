//! Cluster state management
//!
//! Liveness facts the leader consumes: which frontends exist and when they
//! last started, and which backends are alive.

use admit_common::{FrontendId, NodeId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FrontendInfo {
    pub id: FrontendId,
    pub start_time_ms: i64,
    pub alive: bool,
    pub heartbeat_failures: u32,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub node_id: NodeId,
    pub alive: bool,
    pub last_heartbeat: DateTime<Utc>,
}

/// Outcome of a frontend heartbeat that the slot manager must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendEvent {
    /// The process came back with a newer start time.
    Restarted { start_time_ms: i64 },
    Dead,
}

/// In-memory cluster state
pub struct ClusterState {
    frontends: RwLock<HashMap<FrontendId, FrontendInfo>>,
    backends: RwLock<HashMap<NodeId, BackendInfo>>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            frontends: RwLock::new(HashMap::new()),
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Register a frontend, replacing any previous entry.
    pub fn register_frontend(&self, id: FrontendId, start_time_ms: i64) {
        let info = FrontendInfo {
            id: id.clone(),
            start_time_ms,
            alive: true,
            heartbeat_failures: 0,
            last_heartbeat: Utc::now(),
        };
        self.frontends.write().insert(id, info);
    }

    /// Latest known start time of a live frontend.
    pub fn frontend_start_time(&self, id: &FrontendId) -> Option<i64> {
        self.frontends
            .read()
            .get(id)
            .filter(|info| info.alive)
            .map(|info| info.start_time_ms)
    }

    /// Record a successful heartbeat. Unknown frontends are registered.
    pub fn handle_frontend_heartbeat(
        &self,
        id: &FrontendId,
        start_time_ms: i64,
    ) -> Option<FrontendEvent> {
        let mut frontends = self.frontends.write();
        if !frontends.contains_key(id) {
            drop(frontends);
            tracing::info!("Frontend {} joined with start time {}", id, start_time_ms);
            self.register_frontend(id.clone(), start_time_ms);
            return None;
        }
        let info = frontends.get_mut(id)?;

        info.alive = true;
        info.heartbeat_failures = 0;
        info.last_heartbeat = Utc::now();
        if start_time_ms > info.start_time_ms {
            tracing::info!(
                "Frontend {} restarted: start time {} -> {}",
                id,
                info.start_time_ms,
                start_time_ms
            );
            info.start_time_ms = start_time_ms;
            return Some(FrontendEvent::Restarted { start_time_ms });
        }
        None
    }

    /// Record a failed heartbeat. Yields `Dead` once, when the failure count
    /// first exceeds `retry_times`.
    pub fn handle_frontend_heartbeat_failure(
        &self,
        id: &FrontendId,
        retry_times: u32,
    ) -> Option<FrontendEvent> {
        let mut frontends = self.frontends.write();
        let info = frontends.get_mut(id)?;
        info.heartbeat_failures += 1;
        if info.alive && info.heartbeat_failures > retry_times {
            info.alive = false;
            tracing::warn!(
                "Frontend {} is dead after {} failed heartbeats",
                id,
                info.heartbeat_failures
            );
            return Some(FrontendEvent::Dead);
        }
        None
    }

    /// Record a backend heartbeat, registering the backend if needed.
    ///
    /// Backend liveness changes only through [`HeartbeatHandler`], which also
    /// keeps the usage monitor in step.
    ///
    /// [`HeartbeatHandler`]: crate::heartbeat::HeartbeatHandler
    pub(crate) fn handle_backend_heartbeat(&self, node_id: NodeId) {
        let mut backends = self.backends.write();
        let info = backends.entry(node_id).or_insert_with(|| BackendInfo {
            node_id,
            alive: true,
            last_heartbeat: Utc::now(),
        });
        info.alive = true;
        info.last_heartbeat = Utc::now();
    }

    /// Returns true if the backend was alive before.
    pub(crate) fn mark_backend_dead(&self, node_id: NodeId) -> bool {
        let mut backends = self.backends.write();
        match backends.get_mut(&node_id) {
            Some(info) if info.alive => {
                info.alive = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_backend_alive(&self, node_id: NodeId) -> bool {
        self.backends
            .read()
            .get(&node_id)
            .map(|info| info.alive)
            .unwrap_or(false)
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}
