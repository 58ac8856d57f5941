//! Common utilities and types shared across helmsman

pub mod config;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod tracing_middleware;
pub mod utils;

pub use config::{
    AgentConfig, AgentRole, Config, CoordinatorConfig, ElectionConfig, MemberConfig,
    MemberRole, MembershipConfig, VolumeConfig,
};
pub use error::{BusyReason, Error, Result};
pub use metrics::METRICS;
pub use retry::{Backoff, RetryPolicy};
pub use utils::{parse_duration, timestamp_now_millis, validate_name};
