//! Leader RPC surface for slot requests.

use crate::slot_manager::SlotManager;
use admit_common::{
    AdmitError, FrontendId, LeaderTracker, ReleaseSlotRequest, ReleaseSlotResponse,
    RequireSlotRequest, RequireSlotResponse, RpcStatus, SlotService, StatusCode,
};
use async_trait::async_trait;
use std::sync::Arc;
use tonic::Status;

pub struct SlotServiceImpl {
    self_id: FrontendId,
    leader: LeaderTracker,
    manager: Arc<SlotManager>,
}

impl SlotServiceImpl {
    pub fn new(self_id: FrontendId, leader: LeaderTracker, manager: Arc<SlotManager>) -> Self {
        Self {
            self_id,
            leader,
            manager,
        }
    }

    fn check_leader(&self) -> Result<(), Status> {
        if self.leader.is_leader(&self.self_id) {
            return Ok(());
        }
        let current = self
            .leader
            .leader()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Err(AdmitError::NotLeader(format!(
            "{} is not leader, current leader is {}",
            self.self_id, current
        ))
        .into())
    }
}

#[async_trait]
impl SlotService for SlotServiceImpl {
    async fn require_slot_async(
        &self,
        request: RequireSlotRequest,
    ) -> Result<RequireSlotResponse, Status> {
        self.check_leader()?;
        self.manager.require_slot(request.slot)?;
        Ok(RequireSlotResponse {})
    }

    async fn release_slot(
        &self,
        request: ReleaseSlotRequest,
    ) -> Result<ReleaseSlotResponse, Status> {
        self.check_leader()?;
        let status = if self.manager.release_slot(request.slot_id) {
            RpcStatus::ok()
        } else {
            RpcStatus::error(
                StatusCode::NotFound,
                format!("slot {} not found", request.slot_id),
            )
        };
        Ok(ReleaseSlotResponse { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot_manager::tests::{manager, slot_from};
    use admit_common::QueueConfig;
    use tonic::Code;

    #[tokio::test]
    async fn test_follower_rejects_requests() {
        let (manager, _) = manager(QueueConfig::default());
        let leader = LeaderTracker::new(Some(FrontendId::new("fe-2")));
        let service = SlotServiceImpl::new(FrontendId::new("fe-1"), leader.clone(), manager);

        let err = service
            .require_slot_async(RequireSlotRequest {
                slot: slot_from("fe-1", 100),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        leader.set_leader(Some(FrontendId::new("fe-1")));
        service
            .require_slot_async(RequireSlotRequest {
                slot: slot_from("fe-1", 100),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let (manager, _) = manager(QueueConfig {
            query_queue_max_queued_queries: 1,
            ..Default::default()
        });
        let service = SlotServiceImpl::new(
            FrontendId::new("fe-1"),
            LeaderTracker::new(Some(FrontendId::new("fe-1"))),
            manager,
        );

        let slot = slot_from("fe-1", 100);
        let slot_id = slot.slot_id;
        service
            .require_slot_async(RequireSlotRequest { slot })
            .await
            .unwrap();
        let err = service
            .require_slot_async(RequireSlotRequest {
                slot: slot_from("fe-1", 100),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);

        let err = service
            .require_slot_async(RequireSlotRequest {
                slot: slot_from("fe-1", 1),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Aborted);

        let released = service
            .release_slot(ReleaseSlotRequest { slot_id })
            .await
            .unwrap();
        assert!(released.status.is_ok());
        let again = service
            .release_slot(ReleaseSlotRequest { slot_id })
            .await
            .unwrap();
        assert_eq!(again.status.code, StatusCode::NotFound);
    }
}
