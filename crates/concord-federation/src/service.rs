//! # service
//!
//! why: the end-to-end narrative sync flow collaborators run against a node
//! relations: composes ConsensusManager calls; invoked by the binary
//! what: FederationService::sync_narrative (lock, vote, release), SyncOutcome

use concord_core::error::parse_id;
use concord_core::{FactId, NodeId};
use tracing::info;

use crate::error::Result;
use crate::manager::ConsensusManager;

/// Votes cast per sync when no other voters take part
const DEFAULT_VOTES_PER_SYNC: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The fact reached quorum
    Committed,
    /// The votes cast did not reach quorum
    Rejected,
    /// Another node holds the narrative lock
    Locked,
}

pub struct FederationService {
    manager: ConsensusManager,
    node_id: NodeId,
    votes_per_sync: usize,
}

impl FederationService {
    pub fn new(manager: ConsensusManager) -> Self {
        let node_id = manager.node_id().to_string();
        info!(%node_id, "federation service initialized");
        Self {
            manager,
            node_id,
            votes_per_sync: DEFAULT_VOTES_PER_SYNC,
        }
    }

    pub fn with_votes_per_sync(mut self, votes: usize) -> Self {
        self.votes_per_sync = votes;
        self
    }

    pub fn manager(&self) -> &ConsensusManager {
        &self.manager
    }

    /// Lock the narrative, vote its fact towards quorum, then release the lock.
    ///
    /// The narrative id doubles as the fact id. The lock is released even
    /// when voting fails.
    pub async fn sync_narrative(&self, narrative_id: &str) -> Result<SyncOutcome> {
        let narrative_id = parse_id(narrative_id)?;

        if !self.manager.acquire_lock(narrative_id, &self.node_id).await? {
            info!(%narrative_id, "narrative currently locked by another node");
            return Ok(SyncOutcome::Locked);
        }
        info!(%narrative_id, node_id = %self.node_id, "lock acquired for narrative");

        let voted = self.cast_votes(narrative_id).await;
        self.manager.release_lock(narrative_id).await?;

        let outcome = if voted? {
            info!(%narrative_id, "fact committed to ledger via consensus");
            SyncOutcome::Committed
        } else {
            info!(%narrative_id, votes = self.votes_per_sync, "fact rejected, insufficient votes");
            SyncOutcome::Rejected
        };
        info!(%narrative_id, "sync complete");
        Ok(outcome)
    }

    async fn cast_votes(&self, fact_id: FactId) -> Result<bool> {
        let mut committed = false;
        for _ in 0..self.votes_per_sync {
            committed = self.manager.propose_fact(fact_id).await?;
        }
        Ok(committed)
    }
}
