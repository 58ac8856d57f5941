//! Leader election and failover coordination
//!
//! The coordinator is responsible for:
//! - Membership and reachability tracking
//! - Leader election with majority quorum
//! - Liveness checks against the control endpoint
//! - The HTTP control API

pub mod election;
pub mod http;
pub mod liveness;
pub mod membership;
pub mod server;

pub use election::{ElectionEngine, ElectionState, ElectionStatus, ElectionTerm, QuorumStatus};
pub use liveness::{HealthProbe, HttpLeaderProbe, LeaderInfo, LivenessMonitor};
pub use membership::{Member, MembershipStore, PartitionEvent, ReachabilityChange};
pub use server::Coordinator;
