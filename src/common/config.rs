//! Configuration for helmsman components
//!
//! Values are layered: serde defaults, then an optional TOML file, then
//! `HELMSMAN__*` environment variables (e.g. `HELMSMAN__ELECTION__TICK_INTERVAL_MS`).

use crate::common::{Error, Result, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Statically known cluster members
    #[serde(default)]
    pub members: Vec<MemberConfig>,

    #[serde(default)]
    pub membership: MembershipConfig,

    #[serde(default)]
    pub election: ElectionConfig,

    /// Policy used when waiting for the service to come back up
    #[serde(default)]
    pub liveness: RetryPolicy,

    #[serde(default)]
    pub volumes: VolumeConfig,

    /// Agents available for task placement
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

fn default_node_id() -> String {
    "coord-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            log_level: default_log_level(),
            coordinator: CoordinatorConfig::default(),
            members: Vec::new(),
            membership: MembershipConfig::default(),
            election: ElectionConfig::default(),
            liveness: RetryPolicy::default(),
            volumes: VolumeConfig::default(),
            agents: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("HELMSMAN")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for member in &self.members {
            if member.id.is_empty() {
                return Err(Error::InvalidConfig("member id cannot be empty".into()));
            }
            if !seen.insert(member.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate member id: {}",
                    member.id
                )));
            }
        }

        if self.membership.heartbeat_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat timeout must be positive".into(),
            ));
        }
        if self.election.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "election tick interval must be positive".into(),
            ));
        }

        self.liveness.validate()?;
        self.volumes.destroy_retry.validate()?;
        Ok(())
    }
}

/// Eligibility of a member to lead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    /// Votes and may become leader
    LeaderEligible,
    /// Replicates state but never leads or votes
    Follower,
    /// Tracked for reachability only
    Observer,
}

impl MemberRole {
    pub fn is_leader_eligible(&self) -> bool {
        matches!(self, MemberRole::LeaderEligible)
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberRole::LeaderEligible => write!(f, "leader_eligible"),
            MemberRole::Follower => write!(f, "follower"),
            MemberRole::Observer => write!(f, "observer"),
        }
    }
}

/// Placement role of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Public,
    Private,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Public => write!(f, "public"),
            AgentRole::Private => write!(f, "private"),
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Requests taking longer are answered with 408
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Maximum accepted request body size
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_request_timeout() -> u64 {
    10_000
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            request_timeout_ms: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl CoordinatorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: String,
    pub address: String,
    #[serde(default = "default_member_role")]
    pub role: MemberRole,
}

fn default_member_role() -> MemberRole {
    MemberRole::LeaderEligible
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Heartbeat age after which a member is considered unreachable
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// How often stale heartbeats are swept
    #[serde(default = "default_expiry_interval")]
    pub expiry_interval_ms: u64,
}

fn default_heartbeat_timeout() -> u64 {
    5_000
}
fn default_expiry_interval() -> u64 {
    1_000
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            expiry_interval_ms: default_expiry_interval(),
        }
    }
}

impl MembershipConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Interval between election evaluations
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Random jitter added to each tick
    #[serde(default = "default_tick_jitter")]
    pub tick_jitter_ms: u64,

    /// Bound on how long a leader change may take to become visible
    #[serde(default = "default_reelection_window")]
    pub reelection_window_ms: u64,
}

fn default_tick_interval() -> u64 {
    200
}
fn default_tick_jitter() -> u64 {
    100
}
fn default_reelection_window() -> u64 {
    10_000
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            tick_jitter_ms: default_tick_jitter(),
            reelection_window_ms: default_reelection_window(),
        }
    }
}

impl ElectionConfig {
    /// Fixed-interval polling bounded by the re-election window
    pub fn reelection_policy(&self) -> RetryPolicy {
        let interval = Duration::from_millis(self.tick_interval_ms);
        let window = Duration::from_millis(self.reelection_window_ms);
        let attempts = (self.reelection_window_ms / self.tick_interval_ms.max(1)).max(1) as usize;
        RetryPolicy::fixed(attempts + 1, interval).with_deadline(window)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Time the storage backend keeps a detached device busy
    #[serde(default)]
    pub release_delay_ms: u64,

    /// Retry policy for destroy while the backend still holds the device
    #[serde(default = "default_destroy_retry")]
    pub destroy_retry: RetryPolicy,
}

fn default_destroy_retry() -> RetryPolicy {
    RetryPolicy::exponential(10, Duration::from_millis(500), Duration::from_secs(30))
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            release_delay_ms: 0,
            destroy_retry: default_destroy_retry(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub host: String,
    #[serde(default = "default_agent_role")]
    pub role: AgentRole,
}

fn default_agent_role() -> AgentRole {
    AgentRole::Private
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.node_id, "coord-1");
        assert_eq!(config.membership.heartbeat_timeout_ms, 5_000);
        assert_eq!(config.election.tick_interval_ms, 200);
        assert!(config.members.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
            node_id = "coord-7"

            [coordinator]
            bind_addr = "127.0.0.1:9090"

            [[members]]
            id = "m1"
            address = "10.0.0.1:8080"

            [[members]]
            id = "m2"
            address = "10.0.0.2:8080"
            role = "observer"

            [election]
            reelection_window_ms = 3000

            [[agents]]
            host = "10.0.1.1"
            role = "public"
            "#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node_id, "coord-7");
        assert_eq!(config.coordinator.bind_addr.port(), 9090);
        assert_eq!(config.members.len(), 2);
        assert_eq!(config.members[0].role, MemberRole::LeaderEligible);
        assert_eq!(config.members[1].role, MemberRole::Observer);
        assert_eq!(config.election.reelection_window_ms, 3000);
        assert_eq!(config.election.tick_interval_ms, 200);
        assert_eq!(config.agents[0].role, AgentRole::Public);
    }

    #[test]
    fn test_load_wait_policies() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
            [liveness]
            max_attempts = 5
            base_delay_ms = 250
            max_delay_ms = 250
            backoff = "fixed"
            deadline_ms = 2000

            [volumes]
            release_delay_ms = 100

            [volumes.destroy_retry]
            max_attempts = 4
            base_delay_ms = 50
            max_delay_ms = 400
            "#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(
            config.liveness,
            RetryPolicy::fixed(5, Duration::from_millis(250))
                .with_deadline(Duration::from_secs(2))
        );
        assert_eq!(config.volumes.release_delay_ms, 100);
        assert_eq!(
            config.volumes.destroy_retry,
            RetryPolicy::exponential(4, Duration::from_millis(50), Duration::from_millis(400))
        );
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let mut config = Config::default();
        let member = MemberConfig {
            id: "m1".into(),
            address: "a".into(),
            role: MemberRole::LeaderEligible,
        };
        config.members = vec![member.clone(), member];
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_reelection_policy_is_bounded() {
        let election = ElectionConfig {
            tick_interval_ms: 100,
            tick_jitter_ms: 0,
            reelection_window_ms: 1000,
        };
        let policy = election.reelection_policy();
        assert_eq!(policy.max_attempts, 11);
        assert_eq!(policy.deadline(), Some(Duration::from_millis(1000)));
    }
}
