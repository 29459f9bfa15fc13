//! Admit Frontend - query queue on the requesting node

pub mod frontend_service;
pub mod job;
pub mod query_queue;
pub mod requirement;

pub use frontend_service::FrontendServiceImpl;
pub use job::{PlanNodeKind, PlanSummary, QueryContext, QueryJob};
pub use query_queue::QueryQueueManager;
pub use requirement::SlotRequirement;
