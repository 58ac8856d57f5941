//! # helmsman
//!
//! Leader election and failover coordination for a clustered service, plus
//! lifecycle management for the external volumes its stateful workloads use:
//! - Membership with heartbeat-driven reachability
//! - Majority-quorum leader election with explicit abdication
//! - Bounded liveness checks after disruptive operations
//! - Create-or-reuse external volumes that survive scale-to-zero
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!   heartbeats / faults
//!          │
//! ┌────────▼─────────┐ reachability ┌──────────────────┐
//! │ Membership Store ├─────────────►│ Election Engine  │
//! └──────────────────┘              └────────┬─────────┘
//!                                            │ GET/DELETE /v2/leader
//!                                   ┌────────▼─────────┐
//!                                   │ Liveness Monitor │
//!                                   └──────────────────┘
//!
//! ┌──────────────────┐ scale events ┌──────────────────┐
//! │ Workload Manager ├─────────────►│ Volume Manager   │
//! └──────────────────┘              └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! helmsman-coord serve \
//!   --id m1 \
//!   --bind 0.0.0.0:8080 \
//!   --members m1=10.0.0.1:8080,m2=10.0.0.2:8080,m3=10.0.0.3:8080
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Who leads?
//! helmsman leader --coordinator http://localhost:8080
//!
//! # Step down and wait for a new leader
//! helmsman abdicate --attempts 20 --interval-ms 500
//!
//! # Remove a detached volume, tolerating slow release
//! helmsman volumes destroy vol-a --attempts 10 --max-interval-ms 30000
//! ```

pub mod common;
pub mod coordinator;
pub mod ops;
pub mod volume;

// Re-export commonly used types
pub use common::{Config, Error, Result, RetryPolicy};
pub use coordinator::{Coordinator, ElectionEngine, LivenessMonitor, MembershipStore};
pub use volume::{VolumeManager, WorkloadManager};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
