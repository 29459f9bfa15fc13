//! Client pool for frontend-to-leader and leader-to-frontend calls

use crate::rpc::{FrontendService, SlotService};
use crate::types::FrontendId;
use crate::{AdmitError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Clients keyed by frontend name.
///
/// Connections are established by the embedding system and registered here;
/// the pool only hands out shared handles.
pub struct ClientPool<C: ?Sized> {
    clients: RwLock<HashMap<FrontendId, Arc<C>>>,
}

pub type SlotClientPool = ClientPool<dyn SlotService>;
pub type FrontendClientPool = ClientPool<dyn FrontendService>;

impl<C: ?Sized> ClientPool<C> {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the client for `id`.
    pub fn register(&self, id: FrontendId, client: Arc<C>) {
        self.clients.write().insert(id, client);
    }

    pub fn get_client(&self, id: &FrontendId) -> Result<Arc<C>> {
        self.clients
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AdmitError::NotFound(format!("no client for frontend {}", id)))
    }
}

impl<C: ?Sized> Default for ClientPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{FinishSlotRequirementRequest, FinishSlotRequirementResponse, RpcStatus};
    use async_trait::async_trait;
    use tonic::Status;

    struct Echo;

    #[async_trait]
    impl FrontendService for Echo {
        async fn finish_slot_requirement(
            &self,
            _request: FinishSlotRequirementRequest,
        ) -> std::result::Result<FinishSlotRequirementResponse, Status> {
            Ok(FinishSlotRequirementResponse {
                status: RpcStatus::ok(),
            })
        }
    }

    #[test]
    fn test_register_and_get() {
        let pool = FrontendClientPool::new();
        let fe = FrontendId::new("fe-1");
        assert!(matches!(pool.get_client(&fe), Err(AdmitError::NotFound(_))));

        pool.register(fe.clone(), Arc::new(Echo));
        assert!(pool.get_client(&fe).is_ok());
        assert!(pool.get_client(&FrontendId::new("fe-2")).is_err());
    }
}
