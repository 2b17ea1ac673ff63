//! # lock
//!
//! why: serialize edits to one narrative across nodes without ever blocking
//! relations: owned by the federation actor; leases swept on its timer
//! what: NarrativeLock entry, LockTable (fail-fast acquire, idempotent release, lease expiry)

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::ConsensusError;
use crate::{NarrativeId, NodeId};

/// A held narrative lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrativeLock {
    pub narrative_id: NarrativeId,
    pub holder: NodeId,
    pub acquired_at: Instant,
}

impl NarrativeLock {
    pub fn is_expired(&self, now: Instant, lease: Duration) -> bool {
        now.saturating_duration_since(self.acquired_at) >= lease
    }
}

/// Narrative id -> holder. Absence of an entry means unlocked.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<NarrativeId, NarrativeLock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock, failing fast if anyone (including `node_id`) holds it
    pub fn try_acquire(
        &mut self,
        narrative_id: NarrativeId,
        node_id: &str,
        now: Instant,
    ) -> Result<&NarrativeLock, ConsensusError> {
        if let Some(existing) = self.locks.get(&narrative_id) {
            warn!(%narrative_id, holder = %existing.holder, requester = node_id, "lock contention");
            return Err(ConsensusError::LockContention {
                narrative_id,
                holder: existing.holder.clone(),
            });
        }
        info!(%narrative_id, holder = node_id, "narrative locked");
        Ok(self.locks.entry(narrative_id).or_insert(NarrativeLock {
            narrative_id,
            holder: node_id.to_string(),
            acquired_at: now,
        }))
    }

    /// Boolean form of [`try_acquire`](Self::try_acquire)
    pub fn acquire(&mut self, narrative_id: NarrativeId, node_id: &str, now: Instant) -> bool {
        self.try_acquire(narrative_id, node_id, now).is_ok()
    }

    /// Release the lock; releasing an unlocked narrative is a no-op
    pub fn release(&mut self, narrative_id: &NarrativeId) -> Option<NarrativeLock> {
        let released = self.locks.remove(narrative_id);
        if let Some(lock) = &released {
            info!(narrative_id = %lock.narrative_id, holder = %lock.holder, "narrative released");
        }
        released
    }

    pub fn holder(&self, narrative_id: &NarrativeId) -> Option<&str> {
        self.locks.get(narrative_id).map(|l| l.holder.as_str())
    }

    /// Force-release every lock held for at least `lease`
    pub fn expire_leases(&mut self, now: Instant, lease: Duration) -> Vec<NarrativeLock> {
        let expired: Vec<NarrativeId> = self
            .locks
            .values()
            .filter(|l| l.is_expired(now, lease))
            .map(|l| l.narrative_id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.locks.remove(&id))
            .inspect(|lock| {
                warn!(narrative_id = %lock.narrative_id, holder = %lock.holder, "lock lease expired, force-releasing");
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
