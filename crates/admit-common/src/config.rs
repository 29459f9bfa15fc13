//! Query queue configuration

use crate::types::QueryClass;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Global query queue variables.
///
/// Non-positive limits disable the corresponding check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enable_query_queue_select: bool,
    pub enable_query_queue_load: bool,
    pub enable_query_queue_statistic: bool,
    pub enable_group_level_query_queue: bool,

    /// Allocated slots allowed cluster-wide
    pub query_queue_concurrency_limit: i32,

    /// Slots (pending plus allocated) the leader accepts before rejecting
    pub query_queue_max_queued_queries: i32,

    pub query_queue_pending_timeout_second: i32,

    /// Per-backend cpu usage, in permille, at which admission stalls
    pub query_queue_cpu_used_permille_limit: i32,

    /// Per-backend memory fraction (0.0..=1.0) at which admission stalls
    pub query_queue_mem_used_pct_limit: f64,

    /// Reports older than this are ignored by admission
    pub query_queue_resource_usage_interval_ms: i64,

    /// Consecutive heartbeat failures tolerated before a frontend is dead
    pub heartbeat_retry_times: u32,

    /// Period of the leader's timeout checker
    pub slot_manager_check_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enable_query_queue_select: false,
            enable_query_queue_load: false,
            enable_query_queue_statistic: false,
            enable_group_level_query_queue: false,
            query_queue_concurrency_limit: 0,
            query_queue_max_queued_queries: 1024,
            query_queue_pending_timeout_second: 300,
            query_queue_cpu_used_permille_limit: 0,
            query_queue_mem_used_pct_limit: 0.0,
            query_queue_resource_usage_interval_ms: 5000,
            heartbeat_retry_times: 3,
            slot_manager_check_interval_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn is_queue_enabled(&self, class: QueryClass) -> bool {
        match class {
            QueryClass::Select => self.enable_query_queue_select,
            QueryClass::Load => self.enable_query_queue_load,
            QueryClass::Statistic => self.enable_query_queue_statistic,
        }
    }

    pub fn is_global_concurrency_enabled(&self) -> bool {
        self.query_queue_concurrency_limit > 0
    }

    pub fn is_queue_capacity_limited(&self) -> bool {
        self.query_queue_max_queued_queries > 0
    }

    pub fn resource_usage_interval(&self) -> Duration {
        Duration::from_millis(self.query_queue_resource_usage_interval_ms.max(0) as u64)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.slot_manager_check_interval_ms.max(10))
    }

    pub fn validate(&self) -> Result<(), crate::AdmitError> {
        if !(0.0..=1.0).contains(&self.query_queue_mem_used_pct_limit) {
            return Err(crate::AdmitError::Config(format!(
                "query_queue_mem_used_pct_limit must be within [0, 1], got {}",
                self.query_queue_mem_used_pct_limit
            )));
        }
        if self.query_queue_pending_timeout_second <= 0 {
            return Err(crate::AdmitError::Config(format!(
                "query_queue_pending_timeout_second must be positive, got {}",
                self.query_queue_pending_timeout_second
            )));
        }
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self, crate::AdmitError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), crate::AdmitError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Shared, atomically refreshed view of [`QueueConfig`].
///
/// Readers take a snapshot and keep using it for one decision; writers swap
/// in a whole new value.
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<QueueConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn load(&self) -> Arc<QueueConfig> {
        self.inner.read().clone()
    }

    /// Apply `f` to a copy of the current value and publish the result.
    pub fn update(&self, f: impl FnOnce(&mut QueueConfig)) {
        let mut guard = self.inner.write();
        let mut next = QueueConfig::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }
}
