//! Leader abdication with recovery confirmation

use crate::common::{Result, RetryPolicy};
use crate::coordinator::{LeaderInfo, LivenessMonitor};
use crate::ops::client::ControlClient;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct AbdicationReport {
    pub previous: LeaderInfo,
    pub current: LeaderInfo,
    pub elapsed_ms: u64,
}

/// Make the current leader step down, then wait until the service is up
/// again under a different leader.
///
/// `expected` pins the leader the caller believes is current; a mismatch
/// fails with a stale-leader error and nothing changes.
pub async fn abdicate_and_wait(
    client: &ControlClient,
    monitor: &LivenessMonitor,
    expected: Option<&str>,
    policy: &RetryPolicy,
) -> Result<AbdicationReport> {
    let started = Instant::now();
    let previous = monitor.wait_until_up(policy).await?;
    tracing::info!(leader = %previous.leader, "Abdicating current leader");

    let expected = expected.or(previous.leader_id.as_deref());
    client.abdicate(expected).await?;

    let current = monitor
        .wait_for_leader_change(&previous.leader, policy)
        .await?;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        previous = %previous.leader,
        current = %current.leader,
        elapsed_ms,
        "Leader changed"
    );

    Ok(AbdicationReport {
        previous,
        current,
        elapsed_ms,
    })
}
