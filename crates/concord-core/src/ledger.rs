//! # ledger
//!
//! why: count endorsements for proposed facts until a fixed quorum is reached
//! relations: consulted by the federation actor before a fact is appended to the log
//! what: FactProposal, ProposalOutcome, VoteLedger with optional voter deduplication

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::FactId;

/// An open proposal and the votes it has collected so far
#[derive(Debug, Clone)]
pub struct FactProposal {
    pub fact_id: FactId,
    pub vote_count: usize,
    /// Voters seen through `propose_with_voter`
    pub voters: HashSet<String>,
    pub opened_at: Instant,
}

/// Result of casting one vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// Vote recorded, quorum not reached yet
    Pending { votes: usize, quorum: usize },
    /// This vote crossed the threshold; the proposal is closed
    Committed,
    /// The fact was committed earlier; nothing was recorded
    AlreadyCommitted,
    /// The voter had already endorsed this fact; nothing was recorded
    DuplicateVote { votes: usize, quorum: usize },
}

impl ProposalOutcome {
    /// Whether the fact is committed after this call
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed | Self::AlreadyCommitted)
    }

    /// Whether this very call crossed the threshold
    pub fn crossed_quorum(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Vote board keyed by fact id.
///
/// The quorum is a fixed value and is not recomputed when membership
/// changes.
#[derive(Debug)]
pub struct VoteLedger {
    quorum: usize,
    open: HashMap<FactId, FactProposal>,
    committed: HashSet<FactId>,
}

impl VoteLedger {
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum: quorum.max(1),
            open: HashMap::new(),
            committed: HashSet::new(),
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Record one anonymous vote for `fact_id`.
    ///
    /// Every call counts, so a single caller can reach quorum alone.
    pub fn propose(&mut self, fact_id: FactId, now: Instant) -> ProposalOutcome {
        self.cast(fact_id, None, now)
    }

    /// Record a vote attributed to `voter`; repeats from the same voter are
    /// ignored.
    pub fn propose_with_voter(&mut self, fact_id: FactId, voter: &str, now: Instant) -> ProposalOutcome {
        self.cast(fact_id, Some(voter), now)
    }

    fn cast(&mut self, fact_id: FactId, voter: Option<&str>, now: Instant) -> ProposalOutcome {
        if self.committed.contains(&fact_id) {
            debug!(%fact_id, "re-proposal of committed fact");
            return ProposalOutcome::AlreadyCommitted;
        }

        let quorum = self.quorum;
        let proposal = self.open.entry(fact_id).or_insert_with(|| FactProposal {
            fact_id,
            vote_count: 0,
            voters: HashSet::new(),
            opened_at: now,
        });

        if let Some(voter) = voter {
            if !proposal.voters.insert(voter.to_string()) {
                return ProposalOutcome::DuplicateVote {
                    votes: proposal.vote_count,
                    quorum,
                };
            }
        }

        proposal.vote_count += 1;
        let votes = proposal.vote_count;
        info!(%fact_id, votes, quorum, "vote cast");

        if votes >= quorum {
            self.open.remove(&fact_id);
            self.committed.insert(fact_id);
            info!(%fact_id, "fact reached quorum");
            return ProposalOutcome::Committed;
        }
        ProposalOutcome::Pending { votes, quorum }
    }

    /// Release a committed fact once the replicated log holds it; later
    /// re-proposals are answered from the log instead.
    pub fn forget_committed(&mut self, fact_id: &FactId) -> bool {
        self.committed.remove(fact_id)
    }

    /// Abandon every proposal open for longer than `timeout`
    pub fn abandon_stale(&mut self, now: Instant, timeout: Duration) -> Vec<FactId> {
        let stale: Vec<FactId> = self
            .open
            .values()
            .filter(|p| now.saturating_duration_since(p.opened_at) >= timeout)
            .map(|p| p.fact_id)
            .collect();
        for fact_id in &stale {
            self.open.remove(fact_id);
        }
        stale
    }

    pub fn vote_count(&self, fact_id: &FactId) -> Option<usize> {
        self.open.get(fact_id).map(|p| p.vote_count)
    }

    pub fn is_committed(&self, fact_id: &FactId) -> bool {
        self.committed.contains(fact_id)
    }

    pub fn open_proposals(&self) -> usize {
        self.open.len()
    }
}
