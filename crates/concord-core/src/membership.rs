//! # membership
//!
//! why: know which nodes belong to the cluster and which of them are alive
//! relations: synced by the federation actor; feeds RaftNode::set_members
//! what: MembershipEntry with heartbeat lease, MembershipView, sync diffs

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEntry {
    pub node_id: NodeId,
    pub last_heartbeat_at: Instant,
    pub lease_valid: bool,
}

/// Members added and removed by a sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Known cluster members and their liveness leases.
///
/// The local node is always a member and always holds a valid lease.
#[derive(Debug)]
pub struct MembershipView {
    local: NodeId,
    lease: Duration,
    members: BTreeMap<NodeId, MembershipEntry>,
}

impl MembershipView {
    pub fn new(local: impl Into<NodeId>, lease: Duration, now: Instant) -> Self {
        let local = local.into();
        let mut members = BTreeMap::new();
        members.insert(
            local.clone(),
            MembershipEntry {
                node_id: local.clone(),
                last_heartbeat_at: now,
                lease_valid: true,
            },
        );
        Self {
            local,
            lease,
            members,
        }
    }

    /// Replace the member set with `nodes`.
    ///
    /// New members start with a fresh lease; existing members keep their
    /// heartbeat history.
    pub fn sync(&mut self, nodes: &[NodeId], now: Instant) -> MembershipChange {
        let mut change = MembershipChange::default();

        let removed: Vec<NodeId> = self
            .members
            .keys()
            .filter(|id| **id != self.local && !nodes.contains(id))
            .cloned()
            .collect();
        for id in removed {
            self.members.remove(&id);
            change.removed.push(id);
        }

        for id in nodes {
            if !self.members.contains_key(id) {
                self.members.insert(
                    id.clone(),
                    MembershipEntry {
                        node_id: id.clone(),
                        last_heartbeat_at: now,
                        lease_valid: true,
                    },
                );
                change.added.push(id.clone());
            }
        }

        info!(
            members = self.members.len(),
            added = ?change.added,
            removed = ?change.removed,
            "membership synced"
        );
        change
    }

    /// Refresh a member's lease; returns false for unknown nodes
    pub fn record_heartbeat(&mut self, node_id: &str, now: Instant) -> bool {
        match self.members.get_mut(node_id) {
            Some(entry) => {
                entry.last_heartbeat_at = now;
                entry.lease_valid = true;
                true
            }
            None => false,
        }
    }

    /// Whether `node_id` is a member whose lease has not lapsed
    pub fn check_lease(&mut self, node_id: &str, now: Instant) -> bool {
        if node_id == self.local {
            return true;
        }
        let lease = self.lease;
        match self.members.get_mut(node_id) {
            Some(entry) => {
                entry.lease_valid = now.saturating_duration_since(entry.last_heartbeat_at) < lease;
                entry.lease_valid
            }
            None => false,
        }
    }

    /// Re-evaluate every lease; returns members whose lease just lapsed
    pub fn refresh(&mut self, now: Instant) -> Vec<NodeId> {
        let lease = self.lease;
        let mut lapsed = Vec::new();
        for entry in self.members.values_mut() {
            if entry.node_id == self.local {
                continue;
            }
            let valid = now.saturating_duration_since(entry.last_heartbeat_at) < lease;
            if entry.lease_valid && !valid {
                warn!(node_id = %entry.node_id, "member lease lapsed");
                lapsed.push(entry.node_id.clone());
            }
            entry.lease_valid = valid;
        }
        lapsed
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.members.contains_key(node_id)
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.members.keys().cloned().collect()
    }

    /// Members whose lease was valid at the last evaluation
    pub fn live_members(&self) -> Vec<NodeId> {
        self.members
            .values()
            .filter(|e| e.lease_valid)
            .map(|e| e.node_id.clone())
            .collect()
    }

    pub fn get(&self, node_id: &str) -> Option<&MembershipEntry> {
        self.members.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Majority size for the current member count
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }
}
