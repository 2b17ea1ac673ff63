//! # delivery
//!
//! why: a fact that reached quorum must survive lost forwards and leader changes
//! until the replicated log commits it
//! relations: filled from VoteLedger outcomes, acknowledged by ForwardProposalResponse,
//! drained by the federation actor against RaftNode::fact_committed
//! what: PendingFact, FactOutbox (park, due, mark_sent, accept, take_delivered)

use std::time::{Duration, Instant};

use tracing::debug;

use crate::{FactId, Term};

/// A quorum-reached fact waiting for the log to commit it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFact {
    pub fact_id: FactId,
    /// Last time it was forwarded to a leader
    pub sent_at: Option<Instant>,
    /// Term and index a leader reported for it
    pub accepted: Option<(Term, u64)>,
}

/// Facts owed to the replicated log, in the order they reached quorum.
#[derive(Debug, Default)]
pub struct FactOutbox {
    pending: Vec<PendingFact>,
}

impl FactOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fact; false if it is already queued
    pub fn park(&mut self, fact_id: FactId) -> bool {
        if self.contains(&fact_id) {
            return false;
        }
        self.pending.push(PendingFact {
            fact_id,
            sent_at: None,
            accepted: None,
        });
        true
    }

    pub fn contains(&self, fact_id: &FactId) -> bool {
        self.pending.iter().any(|p| p.fact_id == *fact_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Facts to (re)send now.
    ///
    /// A fact accepted in `term` waits for commit. One accepted in an older
    /// term, or sent longer than `retry` ago without an answer, is due again.
    pub fn due(&self, now: Instant, retry: Duration, term: Term) -> Vec<FactId> {
        self.pending
            .iter()
            .filter(|p| match (p.accepted, p.sent_at) {
                (Some((accepted_term, _)), _) if accepted_term >= term => false,
                (Some(_), _) => true,
                (None, Some(sent)) => now.saturating_duration_since(sent) >= retry,
                (None, None) => true,
            })
            .map(|p| p.fact_id)
            .collect()
    }

    pub fn mark_sent(&mut self, fact_id: &FactId, now: Instant) {
        if let Some(pending) = self.pending.iter_mut().find(|p| p.fact_id == *fact_id) {
            pending.sent_at = Some(now);
            pending.accepted = None;
        }
    }

    /// A leader took the fact at `index` in `term`; false if it was not queued
    pub fn accept(&mut self, fact_id: &FactId, term: Term, index: u64) -> bool {
        match self.pending.iter_mut().find(|p| p.fact_id == *fact_id) {
            Some(pending) => {
                debug!(%fact_id, term, index, "fact accepted by leader");
                pending.accepted = Some((term, index));
                true
            }
            None => false,
        }
    }

    /// Remove and return the facts `delivered` reports as committed
    pub fn take_delivered(&mut self, delivered: impl Fn(&FactId) -> bool) -> Vec<FactId> {
        let mut done = Vec::new();
        self.pending.retain(|p| {
            if delivered(&p.fact_id) {
                done.push(p.fact_id);
                false
            } else {
                true
            }
        });
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const RETRY: Duration = Duration::from_millis(150);

    #[test]
    fn unsent_fact_is_due() {
        let mut outbox = FactOutbox::new();
        let fact = Uuid::new_v4();
        assert!(outbox.park(fact));
        assert!(!outbox.park(fact));
        assert_eq!(outbox.due(Instant::now(), RETRY, 1), vec![fact]);
    }

    #[test]
    fn unanswered_forward_is_resent_after_retry() {
        let mut outbox = FactOutbox::new();
        let fact = Uuid::new_v4();
        let sent = Instant::now();
        outbox.park(fact);
        outbox.mark_sent(&fact, sent);

        assert!(outbox.due(sent + Duration::from_millis(100), RETRY, 1).is_empty());
        assert_eq!(outbox.due(sent + RETRY, RETRY, 1), vec![fact]);
    }

    #[test]
    fn accepted_fact_waits_until_term_changes() {
        let mut outbox = FactOutbox::new();
        let fact = Uuid::new_v4();
        let sent = Instant::now();
        outbox.park(fact);
        outbox.mark_sent(&fact, sent);
        assert!(outbox.accept(&fact, 2, 7));

        let later = sent + Duration::from_secs(10);
        assert!(outbox.due(later, RETRY, 2).is_empty());
        assert_eq!(outbox.due(later, RETRY, 3), vec![fact]);
    }

    #[test]
    fn delivered_facts_are_removed() {
        let mut outbox = FactOutbox::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        outbox.park(a);
        outbox.park(b);

        assert_eq!(outbox.take_delivered(|f| *f == a), vec![a]);
        assert_eq!(outbox.len(), 1);
        assert!(outbox.contains(&b));
        assert!(!outbox.accept(&a, 1, 1));
    }
}
