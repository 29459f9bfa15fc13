//! Admit Coordinator - leader-side slot accounting and admission

pub mod cluster_state;
pub mod heartbeat;
pub mod resource_group;
pub mod resource_monitor;
pub mod scheduler;
pub mod slot_manager;
pub mod slot_service;
pub mod views;

pub use cluster_state::{ClusterState, FrontendEvent};
pub use heartbeat::HeartbeatHandler;
pub use resource_group::{ResourceGroup, ResourceGroupRegistry};
pub use resource_monitor::ResourceUsageMonitor;
pub use scheduler::{AllocatedCounts, SlotScheduler};
pub use slot_manager::SlotManager;
pub use slot_service::SlotServiceImpl;
