//! Error types for helmsman

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a volume cannot be mutated right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusyReason {
    /// Bound to another workload; not transient
    AttachedTo(String),
    /// Storage backend has not released the device yet; retry later
    ReleasePending,
}

impl std::fmt::Display for BusyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusyReason::AttachedTo(owner) => write!(f, "attached to workload {}", owner),
            BusyReason::ReleasePending => write!(f, "storage release pending"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Election Errors ===
    #[error("Stale leader: requested resignation of {requested}, current leader is {}", .current.as_deref().unwrap_or("none"))]
    StaleLeader {
        requested: String,
        current: Option<String>,
    },

    #[error("No quorum: {reachable} of {required} required leader-eligible members reachable")]
    NoQuorum { reachable: usize, required: usize },

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Leader change pending: {0}")]
    LeaderPending(String),

    // === Liveness Errors ===
    #[error("Service unavailable after {attempts} attempts (last observed: {last_observed})")]
    ServiceUnavailable {
        attempts: usize,
        last_observed: String,
    },

    #[error("Operation timeout: {operation} (last observed: {last_observed})")]
    Timeout {
        operation: String,
        last_observed: String,
    },

    // === Volume Errors ===
    #[error("Volume already exists: {0}")]
    VolumeAlreadyExists(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Volume {name} is busy: {reason}")]
    VolumeBusy { name: String, reason: BusyReason },

    #[error("Volume {name} cannot {operation} from state {state}")]
    InvalidTransition {
        name: String,
        operation: String,
        state: String,
    },

    #[error("Storage backend error: {0}")]
    Storage(String),

    // === Workload Errors ===
    #[error("Workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("Workload already exists: {0}")]
    WorkloadAlreadyExists(String),

    #[error("No agent satisfies constraint {0}")]
    NoMatchingAgent(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Http(_)
                | Error::ServiceUnavailable { .. }
                | Error::NoQuorum { .. }
                | Error::LeaderPending(_)
                | Error::VolumeBusy {
                    reason: BusyReason::ReleasePending,
                    ..
                }
        )
    }

    /// Last state observed before the failure, when the error carries one
    pub fn last_observed(&self) -> Option<&str> {
        match self {
            Error::ServiceUnavailable { last_observed, .. }
            | Error::Timeout { last_observed, .. } => Some(last_observed),
            Error::StaleLeader { current, .. } => current.as_deref(),
            _ => None,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::MemberNotFound(_) | Error::VolumeNotFound(_) | Error::WorkloadNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::StaleLeader { .. }
            | Error::VolumeAlreadyExists(_)
            | Error::VolumeBusy { .. }
            | Error::InvalidTransition { .. }
            | Error::WorkloadAlreadyExists(_) => StatusCode::CONFLICT,
            Error::InvalidConfig(_) | Error::NoMatchingAgent(_) => StatusCode::BAD_REQUEST,
            Error::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Error::NoQuorum { .. }
            | Error::LeaderPending(_)
            | Error::ServiceUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
