//! Server configuration

use admit_common::{AdmitError, QueueConfig};
use serde::{Deserialize, Serialize};

/// A resource group declared in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub concurrency_limit: i32,
    #[serde(default)]
    pub max_cpu_cores: i32,
}

/// Knobs of the synthetic workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Queries submitted at once
    pub queries: usize,

    /// How long an admitted query holds its slot
    pub hold_ms: u64,

    /// Session query timeout applied to every query
    pub query_timeout_secs: i64,

    /// Backends reporting resource usage to the leader
    pub backends: u32,

    /// Period between running-query snapshots
    pub snapshot_interval_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            queries: 8,
            hold_ms: 500,
            query_timeout_secs: 300,
            backends: 2,
            snapshot_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name of this frontend; it is also the leader
    pub frontend: String,

    pub queue: QueueConfig,

    pub workload: WorkloadConfig,

    /// Queries are spread over these groups round robin
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            frontend: "fe-1".to_string(),
            queue: QueueConfig {
                enable_query_queue_select: true,
                query_queue_concurrency_limit: 2,
                slot_manager_check_interval_ms: 100,
                ..Default::default()
            },
            workload: WorkloadConfig::default(),
            groups: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self, AdmitError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.queue.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), AdmitError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("admit.toml");

        let mut config = ServerConfig::default();
        config.frontend = "fe-7".to_string();
        config.workload.queries = 3;
        config.groups.push(GroupConfig {
            id: 1,
            name: "etl".to_string(),
            concurrency_limit: 1,
            max_cpu_cores: 0,
        });
        config.save_to_file(&path).unwrap();

        let loaded = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("admit.toml");
        std::fs::write(
            &path,
            "frontend = \"fe-2\"\n\n[queue]\nquery_queue_concurrency_limit = 5\n",
        )
        .unwrap();

        let loaded = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.frontend, "fe-2");
        assert_eq!(loaded.queue.query_queue_concurrency_limit, 5);
        assert_eq!(loaded.queue.query_queue_pending_timeout_second, 300);
        assert_eq!(loaded.workload, WorkloadConfig::default());
    }

    #[test]
    fn test_invalid_queue_config_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("admit.toml");
        std::fs::write(&path, "[queue]\nquery_queue_mem_used_pct_limit = 1.5\n").unwrap();

        let err = ServerConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, AdmitError::Config(_)));
    }
}
