//! Slot RPC surface
//!
//! Message shapes exchanged between frontends and the leader. The transport
//! that carries them is provided by the embedding system; errors travel as
//! `tonic::Status`.

use crate::error::AdmitError;
use crate::slot::LogicalSlot;
use crate::types::{GroupId, NodeId, QueryId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tonic::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Cancelled,
    /// The slot outlived its pending deadline on the leader.
    TimedOut,
    NotFound,
    InternalError,
}

/// Application-level status carried inside a successful RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub error_msgs: Vec<String>,
}

impl RpcStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            error_msgs: vec![],
        }
    }

    pub fn error(code: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            error_msgs: vec![msg.into()],
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Joined messages, or the code when none were given.
    pub fn message(&self) -> String {
        if self.error_msgs.is_empty() {
            format!("{:?}", self.code)
        } else {
            self.error_msgs.join("; ")
        }
    }

    /// Error a non-OK status stands for.
    pub fn to_error(&self) -> AdmitError {
        let msg = self.message();
        match self.code {
            StatusCode::TimedOut => AdmitError::PendingTimeout(msg),
            StatusCode::Cancelled => AdmitError::Cancelled(msg),
            StatusCode::NotFound => AdmitError::NotFound(msg),
            StatusCode::Ok | StatusCode::InternalError => AdmitError::Rpc(msg),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequireSlotRequest {
    pub slot: LogicalSlot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequireSlotResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSlotRequest {
    pub slot_id: QueryId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSlotResponse {
    pub status: RpcStatus,
}

/// Sent by the leader once a slot is allocated (status OK) or dropped
/// by the leader (error status, e.g. pending timeout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishSlotRequirementRequest {
    pub slot_id: QueryId,
    pub status: RpcStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishSlotRequirementResponse {
    pub status: RpcStatus,
}

/// Per-group slice of a backend report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUsage {
    pub group_id: GroupId,
    pub cpu_core_used_permille: i32,
    pub mem_used_bytes: i64,
    pub num_running_queries: i32,
}

/// Resource usage piggybacked on a backend heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageReport {
    pub node_id: NodeId,
    pub num_running_queries: i32,
    pub mem_used_bytes: i64,
    pub mem_limit_bytes: i64,
    pub cpu_used_permille: i32,
    pub group_usages: Vec<GroupUsage>,
}

impl ResourceUsageReport {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            num_running_queries: 0,
            mem_used_bytes: 0,
            mem_limit_bytes: 0,
            cpu_used_permille: 0,
            group_usages: vec![],
        }
    }

    pub fn with_cpu(mut self, cpu_used_permille: i32) -> Self {
        self.cpu_used_permille = cpu_used_permille;
        self
    }

    pub fn with_mem(mut self, mem_used_bytes: i64, mem_limit_bytes: i64) -> Self {
        self.mem_used_bytes = mem_used_bytes;
        self.mem_limit_bytes = mem_limit_bytes;
        self
    }

    pub fn with_groups(mut self, group_usages: Vec<GroupUsage>) -> Self {
        self.group_usages = group_usages;
        self
    }
}

/// Served by the leader.
#[async_trait]
pub trait SlotService: Send + Sync {
    /// Register a slot. Returns once the slot is queued; allocation is pushed
    /// back later through [`FrontendService::finish_slot_requirement`].
    async fn require_slot_async(
        &self,
        request: RequireSlotRequest,
    ) -> Result<RequireSlotResponse, Status>;

    async fn release_slot(&self, request: ReleaseSlotRequest)
        -> Result<ReleaseSlotResponse, Status>;
}

/// Served by every query-accepting frontend.
#[async_trait]
pub trait FrontendService: Send + Sync {
    async fn finish_slot_requirement(
        &self,
        request: FinishSlotRequirementRequest,
    ) -> Result<FinishSlotRequirementResponse, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_to_error() {
        let timeout = AdmitError::pending_timeout(2, 300);
        let status = RpcStatus::error(StatusCode::TimedOut, timeout.to_string());
        assert_eq!(status.to_error(), timeout);

        let status = RpcStatus::error(StatusCode::InternalError, "slot not found");
        assert!(matches!(status.to_error(), AdmitError::Rpc(ref m) if m == "slot not found"));
        assert_eq!(RpcStatus::ok().message(), "Ok");
    }

    #[test]
    fn test_group_usage_defaults_to_idle() {
        let usage = GroupUsage {
            group_id: GroupId(3),
            num_running_queries: 1,
            ..Default::default()
        };
        assert_eq!(usage.cpu_core_used_permille, 0);
        assert_eq!(usage.mem_used_bytes, 0);
        assert_eq!(GroupUsage::default().group_id, GroupId(0));
    }
}
