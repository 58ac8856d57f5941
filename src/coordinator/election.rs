//! Leader election engine
//!
//! Elects one leader among the leader-eligible members of the
//! [`MembershipStore`]. A leader needs votes from a strict majority of all
//! leader-eligible members, and only reachable members vote, so a partition
//! that leaves the leader's side without a majority cannot keep or elect a
//! leader there.
//!
//! States move `LeaderStable -> NoLeader -> ElectionInProgress -> LeaderStable`.
//! Losing the leader (resignation or unreachability) drops to `NoLeader`; an
//! election starts at once if a quorum is reachable, otherwise the engine
//! stays in `NoLeader` and reports the lost quorum.

use crate::common::{ElectionConfig, Error, Result, RetryPolicy, METRICS};
use crate::coordinator::membership::{Member, MembershipStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, watch, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionState {
    NoLeader,
    ElectionInProgress,
    LeaderStable,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::NoLeader => write!(f, "no_leader"),
            ElectionState::ElectionInProgress => write!(f, "election_in_progress"),
            ElectionState::LeaderStable => write!(f, "leader_stable"),
        }
    }
}

/// One leadership epoch. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionTerm {
    pub term: u64,
    pub leader_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumStatus {
    /// Leader-eligible members currently reachable
    pub reachable: usize,
    /// Votes needed to elect (strict majority of all leader-eligible members)
    pub required: usize,
    /// All registered leader-eligible members
    pub eligible: usize,
}

impl QuorumStatus {
    pub fn is_met(&self) -> bool {
        self.eligible > 0 && self.reachable >= self.required
    }
}

/// Snapshot of the election state published to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionStatus {
    pub state: ElectionState,
    pub term: u64,
    pub leader_id: Option<String>,
    pub leader_address: Option<String>,
    pub quorum: QuorumStatus,
    /// Set while no quorum can be formed
    pub quorum_lost: bool,
}

impl ElectionStatus {
    fn initial() -> Self {
        Self {
            state: ElectionState::NoLeader,
            term: 0,
            leader_id: None,
            leader_address: None,
            quorum: QuorumStatus {
                reachable: 0,
                required: 1,
                eligible: 0,
            },
            quorum_lost: false,
        }
    }
}

impl std::fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} term={} leader={} quorum={}/{}",
            self.state,
            self.term,
            self.leader_id.as_deref().unwrap_or("none"),
            self.quorum.reachable,
            self.quorum.required
        )
    }
}

fn is_majority(votes: usize, total: usize) -> bool {
    votes > total / 2
}

struct ElectionInner {
    state: ElectionState,
    current_term: u64,
    leader_id: Option<String>,
    history: Vec<ElectionTerm>,
    /// Highest term each member was reachable for
    observed_terms: HashMap<String, u64>,
    /// Leader that resigned; skipped as candidate for the round replacing it
    resigned: Option<String>,
    quorum: QuorumStatus,
    quorum_lost: bool,
}

impl ElectionInner {
    fn observed(&self, member_id: &str) -> u64 {
        self.observed_terms.get(member_id).copied().unwrap_or(0)
    }
}

pub struct ElectionEngine {
    membership: Arc<MembershipStore>,
    inner: Mutex<ElectionInner>,
    status_tx: watch::Sender<ElectionStatus>,
    wakeup: Notify,
}

impl ElectionEngine {
    pub fn new(membership: Arc<MembershipStore>) -> Self {
        let (status_tx, _) = watch::channel(ElectionStatus::initial());
        Self {
            membership,
            inner: Mutex::new(ElectionInner {
                state: ElectionState::NoLeader,
                current_term: 0,
                leader_id: None,
                history: Vec::new(),
                observed_terms: HashMap::new(),
                resigned: None,
                quorum: ElectionStatus::initial().quorum,
                quorum_lost: false,
            }),
            status_tx,
            wakeup: Notify::new(),
        }
    }

    pub fn membership(&self) -> &Arc<MembershipStore> {
        &self.membership
    }

    /// Run one evaluation step against current reachability
    pub fn evaluate(&self) -> ElectionStatus {
        let mut inner = self.inner.lock();
        let members = self.membership.list();
        let eligible: Vec<&Member> = members
            .iter()
            .filter(|m| m.role.is_leader_eligible())
            .collect();
        let voters: Vec<&Member> = eligible.iter().copied().filter(|m| m.reachable).collect();

        inner.quorum = QuorumStatus {
            reachable: voters.len(),
            required: eligible.len() / 2 + 1,
            eligible: eligible.len(),
        };

        if inner.state == ElectionState::LeaderStable {
            let leader_reachable = inner
                .leader_id
                .as_deref()
                .is_some_and(|id| voters.iter().any(|m| m.id == id));

            if leader_reachable && inner.quorum.is_met() {
                let term = inner.current_term;
                for voter in &voters {
                    inner.observed_terms.insert(voter.id.clone(), term);
                }
                return self.publish(&inner, &members);
            }

            tracing::warn!(
                leader = inner.leader_id.as_deref().unwrap_or("none"),
                term = inner.current_term,
                reachable = inner.quorum.reachable,
                required = inner.quorum.required,
                "Leader lost"
            );
            inner.state = ElectionState::NoLeader;
            inner.leader_id = None;
        }

        if !inner.quorum.is_met() {
            if !inner.quorum_lost {
                tracing::warn!(
                    reachable = inner.quorum.reachable,
                    required = inner.quorum.required,
                    eligible = inner.quorum.eligible,
                    "No quorum reachable, staying without leader"
                );
                METRICS.elections_without_quorum.inc();
            }
            inner.quorum_lost = true;
            inner.state = ElectionState::NoLeader;
            return self.publish(&inner, &members);
        }
        inner.quorum_lost = false;

        inner.state = ElectionState::ElectionInProgress;
        inner.current_term += 1;
        let term = inner.current_term;
        self.publish(&inner, &members);

        let others_available = voters
            .iter()
            .any(|m| Some(m.id.as_str()) != inner.resigned.as_deref());
        let candidate = voters
            .iter()
            .filter(|m| !others_available || Some(m.id.as_str()) != inner.resigned.as_deref())
            .max_by(|a, b| {
                (inner.observed(&a.id), &a.id).cmp(&(inner.observed(&b.id), &b.id))
            })
            .copied();

        let Some(candidate) = candidate else {
            inner.state = ElectionState::NoLeader;
            return self.publish(&inner, &members);
        };

        // A voter grants its vote unless it has seen a later term than the candidate
        let candidate_term = inner.observed(&candidate.id);
        let votes = voters
            .iter()
            .filter(|v| inner.observed(&v.id) <= candidate_term)
            .count();

        if !is_majority(votes, eligible.len()) {
            tracing::warn!(
                term,
                candidate = %candidate.id,
                votes,
                eligible = eligible.len(),
                "Election failed"
            );
            inner.state = ElectionState::NoLeader;
            return self.publish(&inner, &members);
        }

        let elected = ElectionTerm {
            term,
            leader_id: candidate.id.clone(),
            started_at: Utc::now(),
        };
        for voter in &voters {
            inner.observed_terms.insert(voter.id.clone(), term);
        }
        inner.history.push(elected);
        inner.leader_id = Some(candidate.id.clone());
        inner.resigned = None;
        inner.state = ElectionState::LeaderStable;

        METRICS.elections_won.inc();
        METRICS.current_term.set(term);
        tracing::info!(
            term,
            leader = %candidate.id,
            address = %candidate.address,
            votes,
            "Leader elected"
        );

        self.publish(&inner, &members)
    }

    fn publish(&self, inner: &ElectionInner, members: &[Member]) -> ElectionStatus {
        let leader_address = inner.leader_id.as_deref().and_then(|id| {
            members
                .iter()
                .find(|m| m.id == id)
                .map(|m| m.address.clone())
        });
        let status = ElectionStatus {
            state: inner.state,
            term: inner.current_term,
            leader_id: inner.leader_id.clone(),
            leader_address,
            quorum: inner.quorum,
            quorum_lost: inner.quorum_lost,
        };
        self.status_tx.send_replace(status.clone());
        status
    }

    /// Step the named leader down. Fails with [`Error::StaleLeader`] and
    /// changes nothing unless `leader_id` is the current leader.
    ///
    /// The replacement is elected by the next evaluation; callers observe it
    /// by polling.
    pub fn resign(&self, leader_id: &str) -> Result<ElectionTerm> {
        let mut inner = self.inner.lock();

        let current = match (inner.state, inner.leader_id.as_deref()) {
            (ElectionState::LeaderStable, Some(current)) if current == leader_id => {
                inner.history.last().cloned()
            }
            _ => None,
        };

        let Some(superseded) = current else {
            METRICS.stale_resignations.inc();
            tracing::warn!(
                requested = leader_id,
                current = inner.leader_id.as_deref().unwrap_or("none"),
                "Rejected resignation of stale leader"
            );
            return Err(Error::StaleLeader {
                requested: leader_id.to_string(),
                current: inner.leader_id.clone(),
            });
        };

        inner.state = ElectionState::NoLeader;
        inner.leader_id = None;
        inner.resigned = Some(leader_id.to_string());
        METRICS.resignations.inc();
        tracing::info!(leader = leader_id, term = superseded.term, "Leader resigned");

        let members = self.membership.list();
        self.publish(&inner, &members);
        drop(inner);

        self.wakeup.notify_one();
        Ok(superseded)
    }

    pub fn status(&self) -> ElectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ElectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_leader(&self) -> Option<Member> {
        let leader_id = self.inner.lock().leader_id.clone()?;
        self.membership.get(&leader_id)
    }

    pub fn current_term(&self) -> u64 {
        self.inner.lock().current_term
    }

    /// Established terms, oldest first
    pub fn history(&self) -> Vec<ElectionTerm> {
        self.inner.lock().history.clone()
    }

    /// Poll until a leader other than `original` is stable
    pub async fn wait_for_leader_change(
        &self,
        original: &str,
        policy: &RetryPolicy,
    ) -> Result<ElectionTerm> {
        policy
            .run("leader change", || {
                let status = self.status();
                let latest = self.history().last().cloned();
                async move {
                    match (status.state, latest) {
                        (ElectionState::LeaderStable, Some(term)) if term.leader_id != original => {
                            Ok(term)
                        }
                        _ if status.quorum_lost => Err(Error::NoQuorum {
                            reachable: status.quorum.reachable,
                            required: status.quorum.required,
                        }),
                        _ => Err(Error::LeaderPending(status.to_string())),
                    }
                }
            })
            .await
    }
}

/// Start the election loop: evaluate on every tick, reachability change or
/// resignation.
pub fn start_election_tasks(
    engine: Arc<ElectionEngine>,
    config: ElectionConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = engine.membership.subscribe();
        engine.evaluate();

        loop {
            let jitter = if config.tick_jitter_ms > 0 {
                rand::random::<u64>() % config.tick_jitter_ms
            } else {
                0
            };
            let tick = Duration::from_millis(config.tick_interval_ms + jitter);

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = engine.wakeup.notified() => {}
                change = changes.recv() => match change {
                    Ok(change) => {
                        tracing::debug!(
                            member = %change.member_id,
                            reachable = change.reachable,
                            "Reachability changed"
                        );
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Reachability updates lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }

            engine.evaluate();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemberRole;

    fn cluster(ids: &[&str]) -> Arc<ElectionEngine> {
        let store = Arc::new(MembershipStore::new(Duration::from_secs(5)));
        for (i, id) in ids.iter().enumerate() {
            store.register(id, &format!("10.0.0.{}:8080", i + 1), MemberRole::LeaderEligible, 0);
        }
        Arc::new(ElectionEngine::new(store))
    }

    #[test]
    fn test_initial_election_picks_highest_id() {
        let engine = cluster(&["m1", "m2", "m3"]);
        assert_eq!(engine.status().state, ElectionState::NoLeader);

        let status = engine.evaluate();
        assert_eq!(status.state, ElectionState::LeaderStable);
        assert_eq!(status.term, 1);
        assert_eq!(status.leader_id.as_deref(), Some("m3"));
        assert_eq!(status.leader_address.as_deref(), Some("10.0.0.3:8080"));
        assert_eq!(engine.history().len(), 1);
    }

    #[test]
    fn test_stable_leader_is_kept() {
        let engine = cluster(&["m1", "m2", "m3"]);
        engine.evaluate();
        let status = engine.evaluate();
        assert_eq!(status.term, 1);
        assert_eq!(status.leader_id.as_deref(), Some("m3"));
    }

    #[test]
    fn test_resign_elects_different_leader() {
        let engine = cluster(&["m1", "m2", "m3"]);
        engine.evaluate();

        let superseded = engine.resign("m3").unwrap();
        assert_eq!(superseded.term, 1);
        assert_eq!(engine.status().state, ElectionState::NoLeader);

        let status = engine.evaluate();
        assert_eq!(status.state, ElectionState::LeaderStable);
        assert_eq!(status.term, 2);
        assert_ne!(status.leader_id.as_deref(), Some("m3"));
    }

    #[test]
    fn test_resign_stale_leader_changes_nothing() {
        let engine = cluster(&["m1", "m2", "m3"]);
        engine.evaluate();
        engine.resign("m3").unwrap();
        engine.evaluate();
        let before = engine.status();

        let err = engine.resign("m3").unwrap_err();
        match err {
            Error::StaleLeader { requested, current } => {
                assert_eq!(requested, "m3");
                assert_eq!(current, before.leader_id);
            }
            other => panic!("expected stale leader, got {:?}", other),
        }
        assert_eq!(engine.status(), before);
    }

    #[test]
    fn test_resign_without_leader_is_stale() {
        let engine = cluster(&["m1"]);
        assert!(matches!(
            engine.resign("m1"),
            Err(Error::StaleLeader { current: None, .. })
        ));
    }

    #[test]
    fn test_single_member_can_be_reelected_after_resign() {
        let engine = cluster(&["solo"]);
        engine.evaluate();
        engine.resign("solo").unwrap();
        let status = engine.evaluate();
        assert_eq!(status.leader_id.as_deref(), Some("solo"));
        assert_eq!(status.term, 2);
    }

    #[test]
    fn test_leader_partition_triggers_reelection() {
        let engine = cluster(&["m1", "m2", "m3"]);
        engine.evaluate();

        engine.membership().mark_unreachable("m3").unwrap();
        let status = engine.evaluate();
        assert_eq!(status.state, ElectionState::LeaderStable);
        assert_eq!(status.leader_id.as_deref(), Some("m2"));
        assert_eq!(status.term, 2);
    }

    #[test]
    fn test_no_quorum_never_fabricates_leader() {
        let engine = cluster(&["m1", "m2", "m3"]);
        engine.evaluate();

        engine.membership().mark_unreachable("m3").unwrap();
        engine.membership().mark_unreachable("m2").unwrap();

        for _ in 0..5 {
            let status = engine.evaluate();
            assert_eq!(status.state, ElectionState::NoLeader);
            assert!(status.quorum_lost);
            assert_eq!(status.leader_id, None);
        }
        // Failed rounds do not consume terms
        assert_eq!(engine.current_term(), 1);
        assert!(engine.current_leader().is_none());
    }

    #[test]
    fn test_rejoining_member_with_stale_term_loses() {
        let engine = cluster(&["m1", "m2", "m3"]);
        engine.evaluate(); // m3 leads term 1

        engine.membership().mark_unreachable("m3").unwrap();
        engine.evaluate(); // m2 leads term 2

        engine.membership().upsert_heartbeat("m3", 10);
        engine.membership().mark_unreachable("m2").unwrap();
        let status = engine.evaluate();

        // m1 saw term 2, m3 only term 1
        assert_eq!(status.leader_id.as_deref(), Some("m1"));
        assert_eq!(status.term, 3);
    }

    #[test]
    fn test_observers_do_not_count() {
        let store = Arc::new(MembershipStore::new(Duration::from_secs(5)));
        store.register("m1", "a", MemberRole::LeaderEligible, 0);
        store.register("o1", "b", MemberRole::Observer, 0);
        store.register("o2", "c", MemberRole::Observer, 0);
        let engine = ElectionEngine::new(store);

        let status = engine.evaluate();
        assert_eq!(status.leader_id.as_deref(), Some("m1"));
        assert_eq!(status.quorum.eligible, 1);
    }

    #[test]
    fn test_terms_strictly_increase() {
        let engine = cluster(&["m1", "m2", "m3", "m4", "m5"]);
        engine.evaluate();
        for _ in 0..4 {
            let leader = engine.status().leader_id.unwrap();
            engine.resign(&leader).unwrap();
            engine.evaluate();
        }
        let terms: Vec<u64> = engine.history().iter().map(|t| t.term).collect();
        assert_eq!(terms, vec![1, 2, 3, 4, 5]);
        assert!(terms.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_wait_for_leader_change_with_background_task() {
        let engine = cluster(&["m1", "m2", "m3"]);
        let handle = start_election_tasks(
            engine.clone(),
            ElectionConfig {
                tick_interval_ms: 10,
                tick_jitter_ms: 5,
                reelection_window_ms: 2000,
            },
        );

        let policy = RetryPolicy::fixed(200, Duration::from_millis(10))
            .with_deadline(Duration::from_secs(2));
        let first = engine.wait_for_leader_change("", &policy).await.unwrap();

        engine.resign(&first.leader_id).unwrap();
        let next = engine
            .wait_for_leader_change(&first.leader_id, &policy)
            .await
            .unwrap();
        assert_ne!(next.leader_id, first.leader_id);
        assert!(next.term > first.term);

        handle.abort();
    }

    #[tokio::test]
    async fn test_wait_for_leader_change_times_out_without_quorum() {
        let engine = cluster(&["m1", "m2", "m3"]);
        engine.evaluate();
        engine.membership().mark_unreachable("m1").unwrap();
        engine.membership().mark_unreachable("m2").unwrap();
        engine.evaluate();

        let policy = RetryPolicy::fixed(1000, Duration::from_millis(10))
            .with_deadline(Duration::from_millis(100));
        let err = engine
            .wait_for_leader_change("m3", &policy)
            .await
            .unwrap_err();
        match err {
            Error::Timeout { last_observed, .. } => {
                assert!(last_observed.contains("No quorum"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
