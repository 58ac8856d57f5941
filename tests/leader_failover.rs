//! Leader abdication and re-election across a three member cluster

use helmsman::common::{ElectionConfig, MemberRole, RetryPolicy};
use helmsman::coordinator::election::start_election_tasks;
use helmsman::coordinator::{ElectionEngine, ElectionState, MembershipStore};
use helmsman::Error;
use std::sync::Arc;
use std::time::Duration;

fn cluster() -> Arc<ElectionEngine> {
    let store = Arc::new(MembershipStore::new(Duration::from_secs(60)));
    store.register("m1", "10.0.0.1:8080", MemberRole::LeaderEligible, 0);
    store.register("m2", "10.0.0.2:8080", MemberRole::LeaderEligible, 0);
    store.register("m3", "10.0.0.3:8080", MemberRole::LeaderEligible, 0);
    Arc::new(ElectionEngine::new(store))
}

#[test]
fn test_abdication_elects_a_different_leader() {
    let engine = cluster();
    let first = engine.evaluate();
    assert_eq!(first.leader_id.as_deref(), Some("m3"));

    let superseded = engine.resign("m3").unwrap();
    assert_eq!(superseded.term, 1);
    assert_eq!(engine.status().state, ElectionState::NoLeader);
    assert!(engine.current_leader().is_none());

    let second = engine.evaluate();
    assert_eq!(second.state, ElectionState::LeaderStable);
    assert_eq!(second.leader_id.as_deref(), Some("m2"));
    assert!(second.term > first.term);

    // Abdicate again: the previous leader is eligible once more
    engine.resign("m2").unwrap();
    let third = engine.evaluate();
    assert_eq!(third.leader_id.as_deref(), Some("m3"));

    let terms: Vec<u64> = engine.history().iter().map(|t| t.term).collect();
    assert!(terms.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(terms.len(), 3);
}

#[test]
fn test_stale_abdication_changes_nothing() {
    let engine = cluster();
    engine.evaluate();
    let before = engine.status();

    match engine.resign("m1") {
        Err(Error::StaleLeader { requested, current }) => {
            assert_eq!(requested, "m1");
            assert_eq!(current.as_deref(), Some("m3"));
        }
        other => panic!("expected stale leader, got {:?}", other),
    }
    assert_eq!(engine.status(), before);
    assert_eq!(engine.history().len(), 1);
}

#[test]
fn test_abdication_without_leader_is_stale() {
    let engine = cluster();
    assert!(matches!(
        engine.resign("m3"),
        Err(Error::StaleLeader { current: None, .. })
    ));
}

#[tokio::test]
async fn test_background_loop_replaces_resigned_leader() {
    let engine = cluster();
    let config = ElectionConfig {
        tick_interval_ms: 20,
        tick_jitter_ms: 5,
        reelection_window_ms: 2_000,
    };
    let task = start_election_tasks(engine.clone(), config.clone());

    let mut status = engine.subscribe();
    status
        .wait_for(|s| s.state == ElectionState::LeaderStable)
        .await
        .unwrap();
    let original = engine.status().leader_id.unwrap();

    engine.resign(&original).unwrap();
    let next = engine
        .wait_for_leader_change(&original, &config.reelection_policy())
        .await
        .unwrap();
    assert_ne!(next.leader_id, original);
    assert_eq!(engine.status().leader_id, Some(next.leader_id));

    task.abort();
}

#[tokio::test]
async fn test_leader_change_times_out_without_quorum() {
    let engine = cluster();
    engine.evaluate();
    engine.membership().mark_unreachable("m1").unwrap();
    engine.membership().mark_unreachable("m2").unwrap();
    engine.evaluate();

    let policy = RetryPolicy::fixed(1_000, Duration::from_millis(5))
        .with_deadline(Duration::from_millis(60));
    let err = engine
        .wait_for_leader_change("m3", &policy)
        .await
        .unwrap_err();
    match err {
        Error::Timeout { last_observed, .. } => assert!(last_observed.contains("No quorum")),
        other => panic!("expected timeout, got {:?}", other),
    }
}
