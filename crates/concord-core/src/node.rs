//! # node
//!
//! why: define the raft node state machine and its role transitions
//! relations: election.rs and replication.rs extend RaftNode; driven by concord-federation
//! what: NodeState enum, RaftConfig, RaftNode struct, timers, persistence bookkeeping

use std::collections::{HashMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConsensusError;
use crate::{AppliedState, Log, LogEntry, NodeId, Snapshot, Term};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Timing and batching knobs, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    /// Must be shorter than `election_timeout_min`
    pub heartbeat_interval: u64,
    /// Consecutive failed elections before a liveness alert is raised
    pub max_split_vote_retries: u32,
    /// Applied entries past the snapshot base that trigger compaction
    pub snapshot_threshold: u64,
    /// Maximum entries shipped per AppendEntries
    pub max_payload_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_split_vote_retries: 5,
            snapshot_threshold: 1000,
            max_payload_entries: 64,
        }
    }
}

/// Operator-facing view of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_last_index: u64,
    /// Set after a checksum mismatch until a leader snapshot replaces the ledger
    pub diverged: bool,
    /// Raised once elections keep failing; cleared by the next leader
    pub liveness_warning: Option<ConsensusError>,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// All voting members, including this node
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: Term,
    /// Node that received our vote in the current term (if any)
    pub voted_for: Option<NodeId>,
    /// Leader we last heard from in the current term
    pub leader_id: Option<NodeId>,
    /// Distinct voters granting us a vote in the current election
    pub votes_received: Vec<NodeId>,
    pub log: Log,
    /// Highest index known to be replicated on a majority
    pub commit_index: u64,
    /// Highest index applied to `applied`
    pub last_applied: u64,
    /// Narrative ledger the committed facts are applied to
    pub applied: AppliedState,
    /// Latest snapshot taken or installed
    pub snapshot: Option<Snapshot>,
    /// Leader only: next index to send to each follower
    pub next_index: HashMap<NodeId, u64>,
    /// Leader only: highest index known replicated on each follower
    pub match_index: HashMap<NodeId, u64>,
    /// Elections in a row that ended without a leader
    pub failed_elections: u32,
    /// Applied state failed a checksum; the next snapshot replaces it
    pub diverged: bool,
    /// Leader only: peers owed a fresh snapshot regardless of their next index
    pub(crate) snapshot_owed: HashSet<NodeId>,
    pub(crate) election_elapsed: u64,
    pub(crate) heartbeat_elapsed: u64,
    pub(crate) randomized_election_timeout: u64,
    /// Highest log index already handed to durable storage
    pub(crate) persisted_index: u64,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: impl Into<NodeId>, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: impl Into<NodeId>, cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        let id = id.into();
        let cluster_nodes = normalize_members(&id, cluster_nodes);

        let mut node = Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            votes_received: Vec::new(),
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            applied: AppliedState::new(),
            snapshot: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            failed_elections: 0,
            diverged: false,
            snapshot_owed: HashSet::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            persisted_index: 0,
        };
        node.reset_election_timer();
        node
    }

    /// Rebuild a node from durable state after a restart.
    ///
    /// Entries already covered by the snapshot are skipped; the rest must be
    /// contiguous after it.
    pub fn restore(
        id: impl Into<NodeId>,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        term: Term,
        voted_for: Option<NodeId>,
        snapshot: Option<Snapshot>,
        entries: Vec<LogEntry>,
    ) -> Self {
        let mut node = Self::with_config(id, cluster_nodes, config);
        node.current_term = term;
        node.voted_for = voted_for;

        if let Some(snapshot) = snapshot {
            node.log
                .reset_to(snapshot.last_included_index, snapshot.last_included_term);
            node.applied = snapshot.state.clone();
            node.last_applied = snapshot.last_included_index;
            node.commit_index = snapshot.last_included_index;
            node.snapshot = Some(snapshot);
        }

        for entry in entries {
            if entry.index <= node.log.last_index() {
                continue;
            }
            if node.log.append(entry).is_err() {
                break;
            }
        }
        node.persisted_index = node.log.last_index();
        node
    }

    /// Peers this node replicates to / requests votes from
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.cluster_nodes.iter().filter(move |n| **n != self.id)
    }

    /// Majority of the current cluster
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.get(index)
    }

    /// Term at `index`, 0 when unknown
    pub fn get_term_at(&self, index: u64) -> Term {
        self.log.term_at(index).unwrap_or(0)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id.clone(),
            role: self.state,
            term: self.current_term,
            leader_id: self.leader_id.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            log_last_index: self.log.last_index(),
            diverged: self.diverged,
            liveness_warning: self.liveness_warning(),
        }
    }

    /// Reject a message from an older term
    pub fn check_term(&self, term: Term) -> Result<(), ConsensusError> {
        if term < self.current_term {
            return Err(ConsensusError::StaleTerm {
                current: self.current_term,
            });
        }
        Ok(())
    }

    /// Adopt a newer term seen on any message
    pub fn observe_term(&mut self, term: Term) {
        if term > self.current_term {
            self.become_follower(term);
        }
    }

    /// Step down to follower, adopting `term` if it is newer
    pub fn become_follower(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        if self.state != NodeState::Follower {
            info!(node_id = %self.id, term = self.current_term, from = ?self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.snapshot_owed.clear();
        self.reset_election_timer();
    }

    pub(crate) fn become_leader(&mut self) {
        info!(node_id = %self.id, term = self.current_term, votes = self.votes_received.len(), "elected leader");
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id.clone());
        self.votes_received.clear();
        self.failed_elections = 0;

        let next = self.log.last_index() + 1;
        let peers: Vec<NodeId> = self.peers().cloned().collect();
        self.next_index = peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = peers.into_iter().map(|p| (p, 0)).collect();
        // announce leadership on the very next tick
        self.heartbeat_elapsed = self.config.heartbeat_interval;
    }

    /// Pick a fresh election timeout and restart the countdown
    pub fn reset_election_timer(&mut self) {
        let min = self.config.election_timeout_min;
        let max = self.config.election_timeout_max.max(min);
        self.randomized_election_timeout = rand::rng().random_range(min..=max);
        self.election_elapsed = 0;
    }

    pub fn randomized_election_timeout(&self) -> u64 {
        self.randomized_election_timeout
    }

    /// Replace the voting membership. This node always stays a member.
    pub fn set_members(&mut self, members: Vec<NodeId>) {
        self.cluster_nodes = normalize_members(&self.id, members);

        if self.is_leader() {
            let next = self.log.last_index() + 1;
            let peers: Vec<NodeId> = self.peers().cloned().collect();
            self.next_index.retain(|p, _| peers.contains(p));
            self.match_index.retain(|p, _| peers.contains(p));
            for peer in peers {
                self.next_index.entry(peer.clone()).or_insert(next);
                self.match_index.entry(peer).or_insert(0);
            }
        }
    }

    /// Entries storage has not confirmed yet, with the index storage must
    /// truncate from before appending them.
    ///
    /// Returns `None` when storage is already in sync. Nothing is marked
    /// durable until [`RaftNode::mark_persisted`] is called.
    pub fn unpersisted(&self) -> Option<(u64, Vec<LogEntry>)> {
        let last = self.log.last_index();
        if self.persisted_index == last {
            return None;
        }
        let from = self.persisted_index.min(last).max(self.log.base_index()) + 1;
        Some((from, self.log.entries_from(from, usize::MAX)))
    }

    /// Storage holds the log through `index`
    pub fn mark_persisted(&mut self, index: u64) {
        self.persisted_index = index.min(self.log.last_index());
    }

    /// Record that the log lost its suffix from `from_index` on
    pub(crate) fn note_truncation(&mut self, from_index: u64) {
        self.persisted_index = self.persisted_index.min(from_index.saturating_sub(1));
    }
}

/// Deduplicate while keeping order, and make sure `local` is present
fn normalize_members(local: &NodeId, members: Vec<NodeId>) -> Vec<NodeId> {
    let mut unique: Vec<NodeId> = Vec::with_capacity(members.len() + 1);
    for member in members {
        if !unique.contains(&member) {
            unique.push(member);
        }
    }
    if !unique.contains(local) {
        unique.push(local.clone());
    }
    unique
}
