//! Push endpoint the leader calls on this frontend.

use std::sync::Arc;

use admit_common::{
    FinishSlotRequirementRequest, FinishSlotRequirementResponse, FrontendService,
};
use async_trait::async_trait;
use tonic::Status;

use crate::query_queue::QueryQueueManager;

pub struct FrontendServiceImpl {
    manager: Arc<QueryQueueManager>,
}

impl FrontendServiceImpl {
    pub fn new(manager: Arc<QueryQueueManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl FrontendService for FrontendServiceImpl {
    async fn finish_slot_requirement(
        &self,
        request: FinishSlotRequirementRequest,
    ) -> Result<FinishSlotRequirementResponse, Status> {
        let status = self
            .manager
            .on_finish_slot_requirement(request.slot_id, request.status);
        Ok(FinishSlotRequirementResponse { status })
    }
}
