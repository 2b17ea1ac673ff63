//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by election.rs / replication.rs, carried by transports
//! what: VoteRequest, AppendEntries, InstallSnapshot, ForwardProposal and their responses

use serde::{Deserialize, Serialize};

use crate::{LogEntry, NodeId, Snapshot, Term};

/// All possible Raft messages between nodes.
///
/// Every variant carries the sender's term; a response whose term is higher
/// than the receiver's tells the receiver to step down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: Term,
    },
    /// Response to a vote request
    VoteResponse { term: Term, vote_granted: bool },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    /// Response to AppendEntries.
    ///
    /// On success `match_index` is the last index known to match the leader;
    /// on failure it is the follower's last log index, used as a backoff hint.
    AppendEntriesResponse {
        term: Term,
        success: bool,
        match_index: u64,
    },
    /// Ship the leader's snapshot to a follower whose next entry was compacted
    InstallSnapshot {
        term: Term,
        leader_id: NodeId,
        snapshot: Snapshot,
    },
    /// Response to InstallSnapshot; `retransfer` asks the leader to send it again
    InstallSnapshotResponse {
        term: Term,
        success: bool,
        retransfer: bool,
        last_included_index: u64,
    },
    /// A fact that reached quorum on a non-leader, handed to the leader
    ForwardProposal { term: Term, payload: String },

    /// Leader's answer to a forwarded fact. `index` is where the fact sits
    /// in the leader's log, `None` when the receiver could not take it.
    ForwardProposalResponse {
        term: Term,
        payload: String,
        index: Option<u64>,
    },
}

impl RaftMessage {
    /// Term carried by the message
    pub fn term(&self) -> Term {
        match self {
            Self::VoteRequest { term, .. }
            | Self::VoteResponse { term, .. }
            | Self::AppendEntries { term, .. }
            | Self::AppendEntriesResponse { term, .. }
            | Self::InstallSnapshot { term, .. }
            | Self::InstallSnapshotResponse { term, .. }
            | Self::ForwardProposal { term, .. }
            | Self::ForwardProposalResponse { term, .. } => *term,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VoteRequest { .. } => "vote_request",
            Self::VoteResponse { .. } => "vote_response",
            Self::AppendEntries { entries, .. } if entries.is_empty() => "heartbeat",
            Self::AppendEntries { .. } => "append_entries",
            Self::AppendEntriesResponse { .. } => "append_entries_response",
            Self::InstallSnapshot { .. } => "install_snapshot",
            Self::InstallSnapshotResponse { .. } => "install_snapshot_response",
            Self::ForwardProposal { .. } => "forward_proposal",
            Self::ForwardProposalResponse { .. } => "forward_proposal_response",
        }
    }
}

/// A message addressed between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

impl Envelope {
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>, message: RaftMessage) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message,
        }
    }

    /// Wire encoding (JSON)
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
