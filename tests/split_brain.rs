//! Network partition scenarios: only a majority side may elect a leader

use helmsman::common::{timestamp_now_millis, MemberRole};
use helmsman::coordinator::{ElectionEngine, ElectionState, MembershipStore};
use std::sync::Arc;
use std::time::Duration;

const MEMBERS: [&str; 5] = ["m1", "m2", "m3", "m4", "m5"];

fn view() -> Arc<ElectionEngine> {
    let store = Arc::new(MembershipStore::new(Duration::from_secs(60)));
    for (i, id) in MEMBERS.iter().enumerate() {
        store.register(
            id,
            &format!("10.0.0.{}:8080", i + 1),
            MemberRole::LeaderEligible,
            0,
        );
    }
    Arc::new(ElectionEngine::new(store))
}

#[test]
fn test_partition_only_majority_elects() {
    // Each side of the partition sees the other as unreachable
    let majority = view();
    let minority = view();
    for id in ["m4", "m5"] {
        majority.membership().mark_unreachable(id).unwrap();
    }
    for id in ["m1", "m2", "m3"] {
        minority.membership().mark_unreachable(id).unwrap();
    }

    let elected = majority.evaluate();
    assert_eq!(elected.state, ElectionState::LeaderStable);
    assert_eq!(elected.leader_id.as_deref(), Some("m3"));
    assert_eq!(elected.quorum.reachable, 3);
    assert_eq!(elected.quorum.required, 3);

    let stuck = minority.evaluate();
    assert_eq!(stuck.state, ElectionState::NoLeader);
    assert!(stuck.quorum_lost);
    assert_eq!(stuck.leader_id, None);
    assert_eq!(stuck.term, 0);
    assert!(minority.history().is_empty());
}

#[test]
fn test_leader_partitioned_away() {
    let engine = view();
    let first = engine.evaluate();
    assert_eq!(first.leader_id.as_deref(), Some("m5"));

    engine.membership().mark_unreachable("m5").unwrap();
    let second = engine.evaluate();
    assert_eq!(second.leader_id.as_deref(), Some("m4"));
    assert!(second.term > first.term);

    // The old leader rejoining does not take over a stable leader
    engine
        .membership()
        .upsert_heartbeat("m5", timestamp_now_millis());
    let third = engine.evaluate();
    assert_eq!(third.leader_id.as_deref(), Some("m4"));
    assert_eq!(third.term, second.term);

    let partitions = engine.membership().partitions();
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].member_id, "m5");
    assert!(partitions[0].ended_at_ms.is_some());
}

#[test]
fn test_quorum_loss_and_recovery() {
    let engine = view();
    engine.evaluate();
    for id in ["m3", "m4", "m5"] {
        engine.membership().mark_unreachable(id).unwrap();
    }

    let lost = engine.evaluate();
    assert_eq!(lost.state, ElectionState::NoLeader);
    assert!(lost.quorum_lost);
    let term_while_lost = lost.term;

    // Repeated rounds without quorum never fabricate a leader or burn terms
    for _ in 0..5 {
        let status = engine.evaluate();
        assert_eq!(status.leader_id, None);
        assert_eq!(status.term, term_while_lost);
    }

    engine
        .membership()
        .upsert_heartbeat("m3", timestamp_now_millis());
    let healed = engine.evaluate();
    assert_eq!(healed.state, ElectionState::LeaderStable);
    assert!(!healed.quorum_lost);
    assert_eq!(healed.term, term_while_lost + 1);
    assert!(healed.leader_id.is_some());
    assert_ne!(healed.leader_id.as_deref(), Some("m4"));
    assert_ne!(healed.leader_id.as_deref(), Some("m5"));
}
