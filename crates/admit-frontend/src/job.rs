//! Query context and job handle seen by the queue

use crate::requirement::SlotRequirement;
use admit_common::slot::DEFAULT_QUERY_TIMEOUT_SECS;
use admit_common::{now_ms, GroupId, QueryClass, QueryId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Kind of a node in the finalized physical plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanNodeKind {
    /// Scan over managed table data
    OlapScan,
    /// Scan over an external catalog (lake, jdbc, files)
    ExternalScan,
    /// Scan over in-memory metadata tables
    SchemaScan,
    Other,
}

impl PlanNodeKind {
    pub fn scans_data(&self) -> bool {
        matches!(self, PlanNodeKind::OlapScan | PlanNodeKind::ExternalScan)
    }
}

/// What the planner hands over: the node kinds of the finalized plan.
#[derive(Debug, Clone, Default)]
pub struct PlanSummary {
    pub nodes: Vec<PlanNodeKind>,
}

impl PlanSummary {
    pub fn new(nodes: Vec<PlanNodeKind>) -> Self {
        Self { nodes }
    }

    pub fn has_data_scan(&self) -> bool {
        self.nodes.iter().any(|n| n.scans_data())
    }
}

/// Session-level facts about one query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query_class: QueryClass,
    /// Running inside a statistics collection context
    pub in_statistics_context: bool,
    pub statistics_job: bool,
    /// Set to false to exempt the query from queueing
    pub need_queued: bool,
    pub query_timeout_secs: i64,
    pub start_time_ms: i64,
    pub group_id: Option<GroupId>,
    pub num_slots: u32,
    pub mem_limit_bytes: i64,
}

impl QueryContext {
    pub fn new(query_class: QueryClass) -> Self {
        Self {
            query_class,
            in_statistics_context: false,
            statistics_job: false,
            need_queued: true,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            start_time_ms: now_ms(),
            group_id: None,
            num_slots: 1,
            mem_limit_bytes: 0,
        }
    }

    pub fn with_query_timeout(mut self, secs: i64) -> Self {
        self.query_timeout_secs = secs;
        self
    }

    pub fn with_group(mut self, group_id: Option<GroupId>) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_resources(mut self, num_slots: u32, mem_limit_bytes: i64) -> Self {
        self.num_slots = num_slots;
        self.mem_limit_bytes = mem_limit_bytes;
        self
    }

    pub fn with_start_time(mut self, start_time_ms: i64) -> Self {
        self.start_time_ms = start_time_ms;
        self
    }

    pub fn exempt(mut self) -> Self {
        self.need_queued = false;
        self
    }

    /// Statistics work is queued under the statistic toggle whatever its
    /// statement type.
    pub fn effective_class(&self) -> QueryClass {
        if self.in_statistics_context || self.statistics_job {
            QueryClass::Statistic
        } else {
            self.query_class
        }
    }
}

/// A query as it moves through admission and execution.
pub struct QueryJob {
    query_id: QueryId,
    plan: PlanSummary,
    requirement: Mutex<Option<Arc<SlotRequirement>>>,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
}

impl QueryJob {
    pub fn new(query_id: QueryId, plan: PlanSummary) -> Self {
        Self {
            query_id,
            plan,
            requirement: Mutex::new(None),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn plan(&self) -> &PlanSummary {
        &self.plan
    }

    pub fn requirement(&self) -> Option<Arc<SlotRequirement>> {
        self.requirement.lock().clone()
    }

    pub(crate) fn set_requirement(&self, requirement: Arc<SlotRequirement>) {
        *self.requirement.lock() = Some(requirement);
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation. The first reason given wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel_reason.lock().get_or_insert_with(|| reason.into());
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> String {
        self.cancel_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "cancelled by user".to_string())
    }

    /// Execution allowance including the time spent waiting for a slot.
    pub fn exec_timeout_secs(&self) -> Option<i64> {
        self.requirement().map(|r| r.snapshot().exec_timeout_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_use_statistic_class() {
        let mut ctx = QueryContext::new(QueryClass::Select);
        assert_eq!(ctx.effective_class(), QueryClass::Select);
        ctx.in_statistics_context = true;
        assert_eq!(ctx.effective_class(), QueryClass::Statistic);

        let mut ctx = QueryContext::new(QueryClass::Load);
        ctx.statistics_job = true;
        assert_eq!(ctx.effective_class(), QueryClass::Statistic);
    }

    #[test]
    fn test_schema_only_plan_has_no_data_scan() {
        let schema_only = PlanSummary::new(vec![PlanNodeKind::SchemaScan, PlanNodeKind::Other]);
        assert!(!schema_only.has_data_scan());
        let external = PlanSummary::new(vec![PlanNodeKind::Other, PlanNodeKind::ExternalScan]);
        assert!(external.has_data_scan());
        assert!(!PlanSummary::default().has_data_scan());
    }

    #[test]
    fn test_first_cancel_reason_wins() {
        let job = QueryJob::new(QueryId::new(), PlanSummary::default());
        assert!(!job.is_cancelled());
        job.cancel("killed");
        job.cancel("again");
        assert!(job.is_cancelled());
        assert_eq!(job.cancel_reason(), "killed");
    }
}
