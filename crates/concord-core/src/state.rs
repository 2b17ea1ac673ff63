//! # state
//!
//! why: the narrative ledger that committed facts are applied to, and its checkpoints
//! relations: fed by replication.rs commit_log, shipped in InstallSnapshot, persisted by storage
//! what: AppliedState (ordered committed facts + merkle checksum), Snapshot

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConsensusError;
use crate::{LogEntry, Term};

/// Facts applied to the narrative ledger, in commit order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    pub facts: Vec<String>,
    /// Index of the last applied log entry
    pub applied_index: u64,
    /// Term of the last applied log entry
    pub applied_term: Term,
}

impl AppliedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed entry.
    ///
    /// Entries at or below `applied_index` are ignored, so replaying a commit
    /// range is harmless. A fact the ledger already holds only advances the
    /// applied index. Returns whether the fact was new.
    pub fn apply(&mut self, entry: &LogEntry) -> bool {
        if entry.index <= self.applied_index {
            return false;
        }
        self.applied_index = entry.index;
        self.applied_term = entry.term;
        if self.contains(&entry.payload) {
            return false;
        }
        self.facts.push(entry.payload.clone());
        true
    }

    pub fn contains(&self, payload: &str) -> bool {
        self.facts.iter().any(|f| f == payload)
    }

    /// Hex SHA-256 Merkle root over the applied facts.
    ///
    /// Leaves are `H(0x00 || fact)`, inner nodes `H(0x01 || left || right)`;
    /// an odd node is promoted unchanged. The empty ledger hashes to `H("")`.
    pub fn checksum(&self) -> String {
        if self.facts.is_empty() {
            return const_hex::encode(Sha256::digest(b""));
        }

        let mut level: Vec<[u8; 32]> = self
            .facts
            .iter()
            .map(|fact| {
                let mut hasher = Sha256::new();
                hasher.update([0x00]);
                hasher.update(fact.as_bytes());
                hasher.finalize().into()
            })
            .collect();

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => {
                        let mut hasher = Sha256::new();
                        hasher.update([0x01]);
                        hasher.update(left);
                        hasher.update(right);
                        hasher.finalize().into()
                    }
                    _ => pair[0],
                })
                .collect();
        }

        const_hex::encode(level[0])
    }
}

/// Point-in-time copy of the applied state, replacing the log prefix up to
/// `last_included_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: Term,
    pub state: AppliedState,
    /// Checksum the sender computed over `state`
    pub checksum: String,
}

impl Snapshot {
    pub fn capture(state: &AppliedState) -> Self {
        Self {
            last_included_index: state.applied_index,
            last_included_term: state.applied_term,
            state: state.clone(),
            checksum: state.checksum(),
        }
    }

    /// Recompute the checksum of the carried state and compare it to the
    /// declared one.
    pub fn verify(&self) -> Result<(), ConsensusError> {
        let actual = self.state.checksum();
        if actual != self.checksum {
            return Err(ConsensusError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }
}
