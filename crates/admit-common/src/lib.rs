//! Admit Common - Shared types, errors, RPC shapes and configuration

pub mod client_pool;
pub mod config;
pub mod error;
pub mod leader;
pub mod rpc;
pub mod slot;
pub mod types;

pub use client_pool::{ClientPool, FrontendClientPool, SlotClientPool};
pub use config::{ConfigHandle, QueueConfig};
pub use error::{AdmitError, Result};
pub use leader::LeaderTracker;
pub use rpc::{
    FinishSlotRequirementRequest, FinishSlotRequirementResponse, FrontendService, GroupUsage,
    ReleaseSlotRequest, ReleaseSlotResponse, RequireSlotRequest, RequireSlotResponse,
    ResourceUsageReport, RpcStatus, SlotService, StatusCode,
};
pub use slot::{LogicalSlot, SlotState};
pub use types::{now_ms, FrontendId, GroupId, NodeId, QueryClass, QueryId};
