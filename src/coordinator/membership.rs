//! Membership store
//!
//! Tracks cluster members and whether they are currently reachable. The
//! store is advisory: a member becomes unreachable when its heartbeat goes
//! stale or when a fault is reported, and recovers on its next heartbeat.
//! Reachability changes are broadcast so the election engine can react.

use crate::common::{
    timestamp_now_millis, Error, MemberConfig, MemberRole, MembershipConfig, Result, METRICS,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub address: String,
    pub role: MemberRole,
    /// Last heartbeat (unix ms)
    pub last_seen_ms: u64,
    pub reachable: bool,
}

/// A period during which a member could not be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEvent {
    pub member_id: String,
    pub started_at_ms: u64,
    /// `None` while the partition is still open
    pub ended_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityChange {
    pub member_id: String,
    pub reachable: bool,
}

#[derive(Default)]
struct Members {
    by_id: BTreeMap<String, Member>,
    partitions: Vec<PartitionEvent>,
}

pub struct MembershipStore {
    members: RwLock<Members>,
    heartbeat_timeout: Duration,
    changes: broadcast::Sender<ReachabilityChange>,
}

impl MembershipStore {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            members: RwLock::new(Members::default()),
            heartbeat_timeout,
            changes,
        }
    }

    /// Build a store seeded with the statically configured members
    pub fn from_config(config: &MembershipConfig, members: &[MemberConfig]) -> Self {
        let store = Self::new(config.heartbeat_timeout());
        let now = timestamp_now_millis();
        for member in members {
            store.register(&member.id, &member.address, member.role, now);
        }
        store
    }

    /// Add a member or replace its address and role. The member starts reachable.
    pub fn register(&self, id: &str, address: &str, role: MemberRole, now_ms: u64) -> Member {
        let mut members = self.members.write();
        let member = members
            .by_id
            .entry(id.to_string())
            .and_modify(|m| {
                m.address = address.to_string();
                m.role = role;
            })
            .or_insert_with(|| Member {
                id: id.to_string(),
                address: address.to_string(),
                role,
                last_seen_ms: now_ms,
                reachable: true,
            })
            .clone();
        tracing::info!(member = id, %address, %role, "Member registered");
        self.refresh_gauge(&members);
        member
    }

    /// Record a heartbeat. Heartbeats older than the last one seen are ignored.
    /// Unknown members are added as observers so they never sway a quorum.
    pub fn upsert_heartbeat(&self, member_id: &str, timestamp_ms: u64) {
        let mut members = self.members.write();
        let recovered = match members.by_id.get_mut(member_id) {
            Some(member) => {
                if timestamp_ms < member.last_seen_ms {
                    tracing::debug!(
                        member = member_id,
                        timestamp_ms,
                        last_seen_ms = member.last_seen_ms,
                        "Ignoring out-of-order heartbeat"
                    );
                    return;
                }
                member.last_seen_ms = timestamp_ms;
                let was_reachable = std::mem::replace(&mut member.reachable, true);
                !was_reachable
            }
            None => {
                tracing::info!(member = member_id, "Heartbeat from unknown member, tracking as observer");
                members.by_id.insert(
                    member_id.to_string(),
                    Member {
                        id: member_id.to_string(),
                        address: member_id.to_string(),
                        role: MemberRole::Observer,
                        last_seen_ms: timestamp_ms,
                        reachable: true,
                    },
                );
                false
            }
        };

        if recovered {
            if let Some(partition) = members
                .partitions
                .iter_mut()
                .rev()
                .find(|p| p.member_id == member_id && p.ended_at_ms.is_none())
            {
                partition.ended_at_ms = Some(timestamp_ms);
            }
            tracing::info!(member = member_id, "Member reachable again");
            self.refresh_gauge(&members);
            self.notify(member_id, true);
        }
    }

    /// Report a member as unreachable (e.g. observed effect of a network fault)
    pub fn mark_unreachable(&self, member_id: &str) -> Result<()> {
        let mut members = self.members.write();
        if !members.by_id.contains_key(member_id) {
            return Err(Error::MemberNotFound(member_id.to_string()));
        }
        self.set_unreachable(&mut members, member_id, timestamp_now_millis());
        Ok(())
    }

    /// Mark every member whose heartbeat is older than the timeout as
    /// unreachable. Returns the ids that changed.
    pub fn expire_stale(&self, now_ms: u64) -> Vec<String> {
        let timeout_ms = self.heartbeat_timeout.as_millis() as u64;
        let mut members = self.members.write();
        let stale: Vec<String> = members
            .by_id
            .values()
            .filter(|m| m.reachable && now_ms.saturating_sub(m.last_seen_ms) > timeout_ms)
            .map(|m| m.id.clone())
            .collect();

        for id in &stale {
            tracing::warn!(member = %id, timeout_ms, "Heartbeat expired");
            self.set_unreachable(&mut members, id, now_ms);
        }
        stale
    }

    fn set_unreachable(&self, members: &mut Members, member_id: &str, at_ms: u64) {
        let Some(member) = members.by_id.get_mut(member_id) else {
            return;
        };
        if !member.reachable {
            return;
        }
        member.reachable = false;
        members.partitions.push(PartitionEvent {
            member_id: member_id.to_string(),
            started_at_ms: at_ms,
            ended_at_ms: None,
        });
        tracing::warn!(member = member_id, "Member unreachable");
        self.refresh_gauge(members);
        self.notify(member_id, false);
    }

    fn notify(&self, member_id: &str, reachable: bool) {
        // No subscribers is fine
        let _ = self.changes.send(ReachabilityChange {
            member_id: member_id.to_string(),
            reachable,
        });
    }

    fn refresh_gauge(&self, members: &Members) {
        let reachable = members.by_id.values().filter(|m| m.reachable).count();
        METRICS.reachable_members.set(reachable as u64);
    }

    /// Reachable members ordered by id
    pub fn list_reachable(&self) -> Vec<Member> {
        self.members
            .read()
            .by_id
            .values()
            .filter(|m| m.reachable)
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Member> {
        self.members.read().by_id.values().cloned().collect()
    }

    pub fn get(&self, member_id: &str) -> Option<Member> {
        self.members.read().by_id.get(member_id).cloned()
    }

    pub fn is_reachable(&self, member_id: &str) -> bool {
        self.members
            .read()
            .by_id
            .get(member_id)
            .is_some_and(|m| m.reachable)
    }

    pub fn partitions(&self) -> Vec<PartitionEvent> {
        self.members.read().partitions.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReachabilityChange> {
        self.changes.subscribe()
    }
}

/// Periodically sweep stale heartbeats
pub fn start_membership_tasks(
    store: Arc<MembershipStore>,
    config: MembershipConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(config.expiry_interval_ms.max(1)));
        loop {
            interval.tick().await;
            store.expire_stale(timestamp_now_millis());
        }
    })
}
