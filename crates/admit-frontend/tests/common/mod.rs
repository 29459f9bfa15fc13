//! In-process cluster for query queue tests: leader candidates and frontends
//! wired together through the client pools, no network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use admit_common::{
    now_ms, ConfigHandle, FinishSlotRequirementRequest, FinishSlotRequirementResponse,
    FrontendClientPool, FrontendId, FrontendService, LeaderTracker, QueryClass, QueryId,
    QueueConfig, ReleaseSlotRequest, ReleaseSlotResponse, RequireSlotRequest, RequireSlotResponse,
    Result, SlotClientPool, SlotService,
};
use admit_coordinator::{
    ClusterState, HeartbeatHandler, ResourceGroupRegistry, ResourceUsageMonitor, SlotManager,
    SlotServiceImpl,
};
use admit_frontend::{
    FrontendServiceImpl, PlanNodeKind, PlanSummary, QueryContext, QueryJob, QueryQueueManager,
};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tonic::Status;

pub struct TestCluster {
    pub config: ConfigHandle,
    pub leader: LeaderTracker,
    pub slot_clients: Arc<SlotClientPool>,
    pub frontend_clients: Arc<FrontendClientPool>,
    pub cluster: Arc<ClusterState>,
    pub groups: Arc<ResourceGroupRegistry>,
    pub monitor: Arc<ResourceUsageMonitor>,
    pub managers: HashMap<String, Arc<SlotManager>>,
    pub frontends: HashMap<String, Arc<QueryQueueManager>>,
}

impl TestCluster {
    /// The first leader candidate starts as leader.
    pub fn new(config: QueueConfig, leaders: &[&str], frontends: &[&str]) -> Self {
        let config = ConfigHandle::new(config);
        let leader = LeaderTracker::new(leaders.first().map(|l| FrontendId::new(*l)));
        let mut cluster = Self {
            leader,
            slot_clients: Arc::new(SlotClientPool::new()),
            frontend_clients: Arc::new(FrontendClientPool::new()),
            cluster: Arc::new(ClusterState::new()),
            groups: Arc::new(ResourceGroupRegistry::new()),
            monitor: Arc::new(ResourceUsageMonitor::new(config.clone())),
            config,
            managers: HashMap::new(),
            frontends: HashMap::new(),
        };
        for name in leaders {
            cluster.add_leader_candidate(name);
        }
        for name in frontends {
            cluster.add_frontend(name, now_ms());
        }
        cluster
    }

    pub fn add_leader_candidate(&mut self, name: &str) {
        let id = FrontendId::new(name);
        let manager = Arc::new(SlotManager::new(
            self.config.clone(),
            self.cluster.clone(),
            self.groups.clone(),
            self.monitor.clone(),
            self.frontend_clients.clone(),
        ));
        manager.start();
        self.slot_clients.register(
            id.clone(),
            Arc::new(SlotServiceImpl::new(id, self.leader.clone(), manager.clone())),
        );
        self.managers.insert(name.to_string(), manager);
    }

    /// Add a frontend whose process started at `start_time_ms`. The leader
    /// learns about it as if it had heartbeated.
    pub fn add_frontend(&mut self, name: &str, start_time_ms: i64) -> Arc<QueryQueueManager> {
        let id = FrontendId::new(name);
        let manager = Arc::new(QueryQueueManager::new(
            id.clone(),
            start_time_ms,
            self.config.clone(),
            self.leader.clone(),
            self.slot_clients.clone(),
        ));
        self.cluster.register_frontend(id.clone(), start_time_ms);
        self.frontend_clients
            .register(id, Arc::new(FrontendServiceImpl::new(manager.clone())));
        self.frontends.insert(name.to_string(), manager.clone());
        manager
    }

    pub fn frontend(&self, name: &str) -> Arc<QueryQueueManager> {
        self.frontends[name].clone()
    }

    pub fn manager(&self, name: &str) -> Arc<SlotManager> {
        self.managers[name].clone()
    }

    pub fn heartbeat(&self, leader: &str) -> HeartbeatHandler {
        HeartbeatHandler::new(self.config.clone(), self.manager(leader))
    }

    pub async fn shutdown(&self) {
        for manager in self.managers.values() {
            manager.stop().await;
        }
    }
}

pub fn select_ctx() -> QueryContext {
    QueryContext::new(QueryClass::Select)
}

pub fn scan_job() -> Arc<QueryJob> {
    Arc::new(QueryJob::new(
        QueryId::new(),
        PlanSummary::new(vec![PlanNodeKind::OlapScan, PlanNodeKind::Other]),
    ))
}

/// Run `maybe_wait` for a fresh scan job on its own task.
pub fn spawn_query(
    frontend: &Arc<QueryQueueManager>,
    ctx: QueryContext,
) -> (Arc<QueryJob>, JoinHandle<Result<()>>) {
    let job = scan_job();
    let handle = {
        let frontend = frontend.clone();
        let job = job.clone();
        tokio::spawn(async move { frontend.maybe_wait(&ctx, &job).await })
    };
    (job, handle)
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A leader running a protocol version without slot requests.
pub struct LegacyLeader;

#[async_trait]
impl SlotService for LegacyLeader {
    async fn require_slot_async(
        &self,
        _request: RequireSlotRequest,
    ) -> std::result::Result<RequireSlotResponse, Status> {
        Err(Status::unimplemented("unknown method requireSlotAsync"))
    }

    async fn release_slot(
        &self,
        _request: ReleaseSlotRequest,
    ) -> std::result::Result<ReleaseSlotResponse, Status> {
        Err(Status::unimplemented("unknown method releaseSlot"))
    }
}

/// Leader wrapper whose release calls fail in transport while `fail_release`
/// is set.
pub struct FlakyRelease {
    pub inner: Arc<dyn SlotService>,
    pub fail_release: AtomicBool,
}

#[async_trait]
impl SlotService for FlakyRelease {
    async fn require_slot_async(
        &self,
        request: RequireSlotRequest,
    ) -> std::result::Result<RequireSlotResponse, Status> {
        self.inner.require_slot_async(request).await
    }

    async fn release_slot(
        &self,
        request: ReleaseSlotRequest,
    ) -> std::result::Result<ReleaseSlotResponse, Status> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(Status::unavailable("connection reset"));
        }
        self.inner.release_slot(request).await
    }
}

/// Frontend endpoint that cannot be reached.
pub struct UnreachableFrontend;

#[async_trait]
impl FrontendService for UnreachableFrontend {
    async fn finish_slot_requirement(
        &self,
        _request: FinishSlotRequirementRequest,
    ) -> std::result::Result<FinishSlotRequirementResponse, Status> {
        Err(Status::unavailable("connection refused"))
    }
}
