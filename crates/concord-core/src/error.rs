//! # error
//!
//! why: give every protocol failure an explicit value instead of a panic
//! relations: returned by node, log, lock and ledger operations
//! what: ConsensusError taxonomy (contention, stale term, gaps, checksum, liveness)

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{NarrativeId, NodeId, Term};

/// Failures surfaced by the consensus core.
///
/// "Quorum not reached" is deliberately absent: an open proposal is a normal
/// outcome, reported through [`crate::ProposalOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ConsensusError {
    /// The narrative is already locked by another holder.
    #[error("narrative {narrative_id} is locked by {holder}")]
    LockContention {
        narrative_id: NarrativeId,
        holder: NodeId,
    },

    /// The sender is behind; `current` is the receiver's term.
    #[error("stale term: receiver is at term {current}")]
    StaleTerm { current: Term },

    /// The operation requires leadership.
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    /// An entry would leave a hole in the log.
    #[error("log gap: expected index {expected}, got {got}")]
    LogGap { expected: u64, got: u64 },

    /// Applied state does not match the leader's checksum.
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Consecutive elections failed to produce a leader.
    #[error("no leader elected after {attempts} consecutive split votes")]
    SplitVoteLivenessWarning { attempts: u32 },

    /// An identifier was not a canonical UUID.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl ConsensusError {
    /// Whether this condition must be escalated to an operator.
    pub fn is_operator_alert(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::SplitVoteLivenessWarning { .. }
        )
    }
}

/// Parse a canonical UUID string, mapping failures into the error taxonomy.
pub fn parse_id(raw: &str) -> Result<uuid::Uuid, ConsensusError> {
    uuid::Uuid::parse_str(raw).map_err(|_| ConsensusError::InvalidIdentifier(raw.to_string()))
}
