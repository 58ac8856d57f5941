//! Service liveness monitor
//!
//! Used after every disruptive operation (leader deletion, partition) to
//! confirm the service answers on its control endpoint again before any new
//! state is asserted. All waiting is bounded by a [`RetryPolicy`].

use crate::common::{Error, Result, RetryPolicy, METRICS};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Body of `GET /v2/leader`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    /// Leader address (host:port)
    pub leader: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<u64>,
}

/// One observation of the service's control endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Ok only for a well-formed leader response
    async fn probe(&self) -> Result<LeaderInfo>;

    /// Human-readable probe target for logs
    fn target(&self) -> String;
}

/// Probes `GET {base_url}/v2/leader`
pub struct HttpLeaderProbe {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLeaderProbe {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn leader_url(&self) -> String {
        format!("{}/v2/leader", self.base_url)
    }
}

#[async_trait]
impl HealthProbe for HttpLeaderProbe {
    async fn probe(&self) -> Result<LeaderInfo> {
        let url = self.leader_url();
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Http(format!("GET {} returned {}", url, status)));
        }

        let info: LeaderInfo = resp
            .json()
            .await
            .map_err(|e| Error::Http(format!("malformed leader response: {}", e)))?;
        if info.leader.is_empty() {
            return Err(Error::Http("leader response without address".into()));
        }
        Ok(info)
    }

    fn target(&self) -> String {
        self.leader_url()
    }
}

pub struct LivenessMonitor {
    probe: Arc<dyn HealthProbe>,
}

impl LivenessMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self { probe }
    }

    pub fn http(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpLeaderProbe::new(
            base_url,
            request_timeout,
        )?)))
    }

    /// Poll until the service reports a leader.
    ///
    /// Fails with [`Error::ServiceUnavailable`] once the attempts are spent,
    /// or [`Error::Timeout`] when the policy deadline passes first.
    pub async fn wait_until_up(&self, policy: &RetryPolicy) -> Result<LeaderInfo> {
        let attempts = AtomicUsize::new(0);
        let target = self.probe.target();

        let result = policy
            .run("wait_until_up", || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let probe = self.probe.clone();
                let target = target.clone();
                async move {
                    METRICS.liveness_probes.inc();
                    match probe.probe().await {
                        Ok(info) => {
                            tracing::info!(
                                attempt,
                                %target,
                                leader = %info.leader,
                                "Service is up"
                            );
                            Ok(info)
                        }
                        Err(e) => {
                            METRICS.liveness_probe_failures.inc();
                            tracing::warn!(
                                attempt,
                                %target,
                                observed = %e,
                                "Service not up yet"
                            );
                            Err(e)
                        }
                    }
                }
            })
            .await;

        result.map_err(|e| {
            if e.is_retryable() {
                Error::ServiceUnavailable {
                    attempts: attempts.load(Ordering::SeqCst),
                    last_observed: e.to_string(),
                }
            } else {
                e
            }
        })
    }

    /// Poll until the service reports a leader whose address differs from
    /// `original_leader`.
    pub async fn wait_for_leader_change(
        &self,
        original_leader: &str,
        policy: &RetryPolicy,
    ) -> Result<LeaderInfo> {
        let attempts = AtomicUsize::new(0);

        policy
            .run("leader change", || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let probe = self.probe.clone();
                async move {
                    METRICS.liveness_probes.inc();
                    let info = probe.probe().await.inspect_err(|e| {
                        METRICS.liveness_probe_failures.inc();
                        tracing::warn!(attempt, observed = %e, "Leader probe failed");
                    })?;
                    tracing::info!(attempt, leader = %info.leader, "Observed leader");
                    if info.leader == original_leader {
                        return Err(Error::LeaderPending(format!(
                            "leader still {}",
                            original_leader
                        )));
                    }
                    Ok(info)
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed script of observations, repeating the last one
    struct ScriptedProbe {
        script: Mutex<VecDeque<std::result::Result<&'static str, &'static str>>>,
    }

    impl ScriptedProbe {
        fn new(script: Vec<std::result::Result<&'static str, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> Result<LeaderInfo> {
            let mut script = self.script.lock();
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().copied()
            };
            match next {
                Some(Ok(leader)) => Ok(LeaderInfo {
                    leader: leader.to_string(),
                    leader_id: None,
                    term: None,
                }),
                Some(Err(e)) => Err(Error::Http(e.to_string())),
                None => Err(Error::Http("empty script".into())),
            }
        }

        fn target(&self) -> String {
            "scripted".into()
        }
    }

    #[tokio::test]
    async fn test_wait_until_up_after_failures() {
        let probe = ScriptedProbe::new(vec![
            Err("connection refused"),
            Err("503 Service Unavailable"),
            Ok("10.0.0.2:8080"),
        ]);
        let monitor = LivenessMonitor::new(probe);

        let info = monitor
            .wait_until_up(&RetryPolicy::fixed(5, Duration::from_millis(1)))
            .await
            .unwrap();
        assert_eq!(info.leader, "10.0.0.2:8080");
    }

    #[tokio::test]
    async fn test_wait_until_up_exhausted() {
        let monitor = LivenessMonitor::new(ScriptedProbe::new(vec![Err("connection refused")]));

        let err = monitor
            .wait_until_up(&RetryPolicy::fixed(3, Duration::from_millis(1)))
            .await
            .unwrap_err();
        match err {
            Error::ServiceUnavailable {
                attempts,
                last_observed,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_observed.contains("connection refused"));
            }
            other => panic!("expected service unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_until_up_deadline() {
        let monitor = LivenessMonitor::new(ScriptedProbe::new(vec![Err("connection refused")]));
        let policy = RetryPolicy::fixed(10_000, Duration::from_millis(10))
            .with_deadline(Duration::from_millis(50));

        let err = monitor.wait_until_up(&policy).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_leader_change() {
        let probe = ScriptedProbe::new(vec![
            Ok("10.0.0.1:8080"),
            Err("connection refused"),
            Ok("10.0.0.1:8080"),
            Ok("10.0.0.3:8080"),
        ]);
        let monitor = LivenessMonitor::new(probe);

        let info = monitor
            .wait_for_leader_change("10.0.0.1:8080", &RetryPolicy::fixed(10, Duration::from_millis(1)))
            .await
            .unwrap();
        assert_eq!(info.leader, "10.0.0.3:8080");
    }

    #[tokio::test]
    async fn test_leader_never_changes() {
        let monitor = LivenessMonitor::new(ScriptedProbe::new(vec![Ok("10.0.0.1:8080")]));

        let err = monitor
            .wait_for_leader_change("10.0.0.1:8080", &RetryPolicy::fixed(4, Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaderPending(_)));
    }
}
