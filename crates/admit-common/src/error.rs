//! Admission error types
//!
//! The taxonomy variants carry the rendered user-visible message so that an
//! error raised on the leader survives the trip through `tonic::Status` and
//! reaches the caller unchanged.

use thiserror::Error;
use tonic::{Code, Status};

const ALLOCATE_FAILED: &str = "Failed to allocate resource to query";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    /// The queue is full; no slot was registered.
    #[error("{0}")]
    CapacityExceeded(String),

    /// The slot aged out while REQUIRING.
    #[error("{0}")]
    PendingTimeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The requester restarted after it built the slot.
    #[error("{0}")]
    StaleFrontend(String),

    #[error("RPC failed: {0}")]
    Rpc(String),

    #[error("Not leader: {0}")]
    NotLeader(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for AdmitError {
    fn from(e: std::io::Error) -> Self {
        AdmitError::Io(e.to_string())
    }
}

impl From<toml::ser::Error> for AdmitError {
    fn from(e: toml::ser::Error) -> Self {
        AdmitError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for AdmitError {
    fn from(e: toml::de::Error) -> Self {
        AdmitError::Config(e.to_string())
    }
}

impl AdmitError {
    pub fn capacity_exceeded(capacity: i32) -> Self {
        AdmitError::CapacityExceeded(format!(
            "{}: the number of pending queries exceeds capacity [{}], \
             you could modify the global variable [query_queue_max_queued_queries] to increase the capacity",
            ALLOCATE_FAILED, capacity
        ))
    }

    /// Names whichever session variable bounded the wait.
    pub fn pending_timeout(pending_timeout_secs: i64, query_timeout_secs: i64) -> Self {
        let (secs, variable) = if query_timeout_secs < pending_timeout_secs {
            (query_timeout_secs, "query_timeout")
        } else {
            (pending_timeout_secs, "query_queue_pending_timeout_second")
        };
        AdmitError::PendingTimeout(format!(
            "{}: pending timeout [{}s], you could modify the session variable [{}] to pending more time",
            ALLOCATE_FAILED, secs, variable
        ))
    }

    pub fn stale_frontend(frontend: &str, slot_start_ms: i64, known_start_ms: i64) -> Self {
        AdmitError::StaleFrontend(format!(
            "FeStartTime is not the latest: frontend {} built the slot at start time {}, latest start time is {}",
            frontend, slot_start_ms, known_start_ms
        ))
    }

    /// Legacy peers answer an unrecognized RPC with `Unimplemented`.
    pub fn is_unknown_method(status: &Status) -> bool {
        status.code() == Code::Unimplemented
    }
}

impl From<AdmitError> for Status {
    fn from(e: AdmitError) -> Self {
        match e {
            AdmitError::CapacityExceeded(msg) => Status::resource_exhausted(msg),
            AdmitError::PendingTimeout(msg) => Status::deadline_exceeded(msg),
            AdmitError::StaleFrontend(msg) => Status::aborted(msg),
            AdmitError::Cancelled(reason) => Status::cancelled(reason),
            AdmitError::NotLeader(msg) => Status::failed_precondition(msg),
            AdmitError::NotFound(msg) => Status::not_found(msg),
            other => Status::internal(other.to_string()),
        }
    }
}

impl From<Status> for AdmitError {
    fn from(status: Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            Code::ResourceExhausted => AdmitError::CapacityExceeded(msg),
            Code::DeadlineExceeded => AdmitError::PendingTimeout(msg),
            Code::Aborted => AdmitError::StaleFrontend(msg),
            Code::Cancelled => AdmitError::Cancelled(msg),
            Code::FailedPrecondition => AdmitError::NotLeader(msg),
            _ => AdmitError::Rpc(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, AdmitError>;
