//! # replication
//!
//! why: replicate committed facts from the leader and keep follower logs gap-free
//! relations: extends RaftNode (node.rs) after election.rs hands over leadership
//! what: AppendEntries both sides, commit index advancement, applying to the ledger,
//! snapshots with checksum verification, forwarded proposals

use tracing::{debug, error, info, warn};

use crate::error::ConsensusError;
use crate::{LogEntry, NodeId, NodeState, RaftMessage, RaftNode, Snapshot, Term};

impl RaftNode {
    /// Append a fact to the leader's log.
    ///
    /// The entry is committed once a majority (counting the leader itself)
    /// has acknowledged it; a single-member cluster commits immediately.
    pub fn append_entry(&mut self, payload: impl Into<String>) -> Result<LogEntry, ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader {
                leader_hint: self.leader_id.clone(),
            });
        }
        let entry = LogEntry::new(self.current_term, self.log.last_index() + 1, payload);
        self.log.append(entry.clone())?;
        info!(node_id = %self.id, term = entry.term, index = entry.index, payload = %entry.payload, "appended entry");
        self.advance_commit_index();
        Ok(entry)
    }

    /// AppendEntries (or InstallSnapshot) for every peer
    pub fn replicate_to_all(&mut self) -> Vec<(NodeId, RaftMessage)> {
        let peers: Vec<NodeId> = self.peers().cloned().collect();
        peers
            .into_iter()
            .filter_map(|peer| self.create_append_entries(&peer).map(|msg| (peer, msg)))
            .collect()
    }

    /// Build the next replication message for `peer`, or None if not leader.
    ///
    /// Carries every entry from the peer's `next_index` (capped by
    /// `max_payload_entries`). The snapshot is sent instead when that entry
    /// has been compacted away or the peer asked for a retransfer.
    pub fn create_append_entries(&self, peer: &str) -> Option<RaftMessage> {
        if !self.is_leader() {
            return None;
        }
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .max(1);

        if next <= self.log.base_index() || self.snapshot_owed.contains(peer) {
            if let Some(snapshot) = &self.snapshot {
                return Some(RaftMessage::InstallSnapshot {
                    term: self.current_term,
                    leader_id: self.id.clone(),
                    snapshot: snapshot.clone(),
                });
            }
        }

        let prev_log_index = next - 1;
        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries: self.log.entries_from(next, self.config.max_payload_entries),
            leader_commit: self.commit_index,
        })
    }

    /// Handle an AppendEntries RPC as follower.
    ///
    /// Returns the response and whether the election timer was reset (any
    /// RPC from a current leader resets it, even one rejected for log
    /// inconsistency).
    pub fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: &str,
        prev_log_index: u64,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> (RaftMessage, bool) {
        if let Err(err) = self.check_term(term) {
            warn!(node_id = %self.id, leader = leader_id, term, %err, "rejecting append entries");
            return (self.append_response(false, self.log.last_index()), false);
        }
        if term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id.to_string());
        self.failed_elections = 0;
        self.reset_election_timer();

        if prev_log_index > self.log.last_index() {
            debug!(node_id = %self.id, prev_log_index, last = self.log.last_index(), "rejecting append entries: gap");
            return (self.append_response(false, self.log.last_index()), true);
        }
        // below the snapshot base everything is committed and therefore matches
        if prev_log_index >= self.log.base_index()
            && self.log.term_at(prev_log_index) != Some(prev_log_term)
        {
            debug!(node_id = %self.id, prev_log_index, prev_log_term, "rejecting append entries: term mismatch");
            let hint = prev_log_index.saturating_sub(1).min(self.log.last_index());
            return (self.append_response(false, hint), true);
        }

        let mut last_new_index = prev_log_index;
        for entry in entries {
            let index = entry.index;
            if index <= self.log.base_index() {
                last_new_index = last_new_index.max(index);
                continue;
            }
            match self.log.term_at(index) {
                Some(existing) if existing == entry.term => {}
                Some(_) => {
                    if index <= self.commit_index {
                        error!(node_id = %self.id, index, "leader sent a conflicting committed entry");
                        return (self.append_response(false, self.commit_index), true);
                    }
                    warn!(node_id = %self.id, index, "truncating conflicting suffix");
                    self.log.truncate_from(index);
                    self.note_truncation(index);
                    if self.log.append(entry).is_err() {
                        return (self.append_response(false, self.log.last_index()), true);
                    }
                }
                None => {
                    if let Err(err) = self.log.append(entry) {
                        debug!(node_id = %self.id, %err, "rejecting append entries");
                        return (self.append_response(false, self.log.last_index()), true);
                    }
                }
            }
            last_new_index = index;
        }

        if leader_commit > self.commit_index {
            let new_commit = leader_commit.min(last_new_index);
            if new_commit > self.commit_index {
                debug!(node_id = %self.id, from = self.commit_index, to = new_commit, "follower commit index advanced");
                self.commit_index = new_commit;
            }
        }

        (self.append_response(true, last_new_index), true)
    }

    /// Single-entry AppendEntries as exposed by the facade.
    ///
    /// The previous-entry check uses this node's own view of `index - 1`, so
    /// duplicates are accepted idempotently and gaps are rejected.
    pub fn accept_entry(&mut self, term: Term, leader_id: &str, entry: LogEntry) -> (RaftMessage, bool) {
        let prev_log_index = entry.index.saturating_sub(1);
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let commit = self.commit_index;
        self.handle_append_entries(term, leader_id, prev_log_index, prev_log_term, vec![entry], commit)
    }

    /// Handle an AppendEntries response as leader; returns true if the
    /// commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        term: Term,
        success: bool,
        from: &str,
        match_index: u64,
    ) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if !self.is_leader() || term < self.current_term {
            return false;
        }

        if success {
            let matched = self.match_index.entry(from.to_string()).or_insert(0);
            *matched = (*matched).max(match_index.min(self.log.last_index()));
            let matched = *matched;
            self.next_index.insert(from.to_string(), matched + 1);
            return self.advance_commit_index();
        }

        let next = self
            .next_index
            .get(from)
            .copied()
            .unwrap_or(self.log.last_index() + 1);
        let backoff = next.saturating_sub(1).min(match_index + 1).max(1);
        debug!(node_id = %self.id, peer = from, next, backoff, "append entries rejected, backing off");
        self.next_index.insert(from.to_string(), backoff);
        false
    }

    /// Move the commit index to the highest current-term entry stored on a
    /// majority. Entries from earlier terms commit indirectly.
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let quorum = self.quorum_size();
        let mut n = self.log.last_index();
        while n > self.commit_index {
            if self.log.term_at(n) == Some(self.current_term) {
                let replicas = 1 + self
                    .peers()
                    .filter(|p| self.match_index.get(*p).copied().unwrap_or(0) >= n)
                    .count();
                if replicas >= quorum {
                    info!(node_id = %self.id, from = self.commit_index, to = n, replicas, "commit index advanced");
                    self.commit_index = n;
                    return true;
                }
            }
            n -= 1;
        }
        false
    }

    /// Apply committed entries up to `index` to the narrative ledger.
    ///
    /// Each entry is applied exactly once, in index order; indices past the
    /// commit index are clamped, so retries are harmless. Returns the entries
    /// applied by this call.
    pub fn commit_log(&mut self, index: u64) -> Vec<LogEntry> {
        let target = index.min(self.commit_index);
        let mut applied = Vec::new();
        while self.last_applied < target {
            let next = self.last_applied + 1;
            let Some(entry) = self.log.get(next).cloned() else {
                break;
            };
            self.applied.apply(&entry);
            self.last_applied = next;
            applied.push(entry);
        }
        if !applied.is_empty() {
            info!(node_id = %self.id, last_applied = self.last_applied, count = applied.len(), "applied committed entries");
        }
        applied
    }

    /// Apply everything committed so far
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        self.commit_log(self.commit_index)
    }

    /// Leader liveness ping without a term.
    ///
    /// Only the leader this node already follows may reset its election
    /// timer; anything else is ignored.
    pub fn handle_heartbeat(&mut self, leader_id: &str) -> bool {
        if self.state == NodeState::Follower && self.leader_id.as_deref() == Some(leader_id) {
            self.reset_election_timer();
            debug!(node_id = %self.id, leader = leader_id, "heartbeat");
            return true;
        }
        debug!(node_id = %self.id, leader = leader_id, known = ?self.leader_id, "ignoring heartbeat from unknown leader");
        false
    }

    /// Whether enough has been applied since the last snapshot to compact
    pub fn should_snapshot(&self) -> bool {
        self.last_applied.saturating_sub(self.log.base_index()) >= self.config.snapshot_threshold
    }

    /// Capture the applied state at the commit index and compact the log
    /// below it.
    pub fn snapshot_state(&mut self) -> Snapshot {
        self.get_entries_to_apply();
        let snapshot = Snapshot::capture(&self.applied);
        self.log
            .compact_to(snapshot.last_included_index, snapshot.last_included_term);
        info!(
            node_id = %self.id,
            index = snapshot.last_included_index,
            term = snapshot.last_included_term,
            checksum = %snapshot.checksum,
            "snapshot taken"
        );
        self.snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Handle an InstallSnapshot RPC as follower.
    ///
    /// The received state is checked against its declared checksum before
    /// anything is replaced; on mismatch the snapshot is dropped and the
    /// response asks for a retransfer. A snapshot no newer than the applied
    /// state is a no-op, unless this node has diverged: then it replaces the
    /// ledger outright.
    pub fn handle_install_snapshot(
        &mut self,
        term: Term,
        leader_id: &str,
        snapshot: Snapshot,
    ) -> (RaftMessage, bool) {
        let index = snapshot.last_included_index;
        if let Err(err) = self.check_term(term) {
            debug!(node_id = %self.id, leader = leader_id, index, %err, "ignoring snapshot");
            return (self.install_response(false, false, index), false);
        }
        if term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id.to_string());
        self.reset_election_timer();

        if let Err(err) = snapshot.verify() {
            error!(node_id = %self.id, leader = leader_id, index, %err, "snapshot checksum mismatch, requesting retransfer");
            return (self.install_response(false, true, index), true);
        }
        if index <= self.last_applied && !self.diverged {
            return (self.install_response(true, false, index), true);
        }

        // keep the log suffix only when it still agrees with the snapshot
        if index >= self.log.base_index() && self.log.term_at(index) == Some(snapshot.last_included_term) {
            self.log.compact_to(index, snapshot.last_included_term);
        } else {
            self.log.reset_to(index, snapshot.last_included_term);
        }
        self.applied = snapshot.state.clone();
        self.last_applied = index;
        self.commit_index = self.commit_index.max(index);
        self.persisted_index = self.persisted_index.min(self.log.last_index());
        if self.diverged {
            warn!(node_id = %self.id, leader = leader_id, index, "diverged ledger replaced by leader snapshot");
            self.diverged = false;
        } else {
            info!(node_id = %self.id, leader = leader_id, index, "snapshot installed");
        }
        self.snapshot = Some(snapshot);

        (self.install_response(true, false, index), true)
    }

    /// Handle an InstallSnapshot response as leader
    pub fn handle_install_snapshot_response(
        &mut self,
        term: Term,
        success: bool,
        retransfer: bool,
        from: &str,
        last_included_index: u64,
    ) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if !self.is_leader() || term < self.current_term {
            return false;
        }
        if success {
            self.snapshot_owed.remove(from);
            let matched = self.match_index.entry(from.to_string()).or_insert(0);
            *matched = (*matched).max(last_included_index);
            self.next_index.insert(from.to_string(), last_included_index + 1);
            return self.advance_commit_index();
        }
        if retransfer {
            error!(node_id = %self.id, peer = from, "follower needs a full state transfer, resending snapshot");
            if self.snapshot.is_none() || self.last_applied < self.commit_index {
                self.snapshot_state();
            }
            self.snapshot_owed.insert(from.to_string());
            self.next_index.insert(from.to_string(), self.log.base_index());
        }
        false
    }

    /// Compare the locally applied state with the leader's expected checksum.
    ///
    /// A mismatch on a non-leader marks the node diverged, so the next
    /// snapshot from the leader replaces its ledger.
    pub fn verify_checksum(&mut self, expected: &str) -> Result<(), ConsensusError> {
        let actual = self.applied.checksum();
        if actual != expected {
            error!(node_id = %self.id, expected, actual = %actual, "applied state diverged from leader");
            if !self.is_leader() {
                self.diverged = true;
            }
            return Err(ConsensusError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Ask the current leader for a full state transfer; None while no
    /// leader is known.
    pub fn retransfer_request(&self) -> Option<(NodeId, RaftMessage)> {
        let leader = self.leader_id.clone().filter(|l| *l != self.id)?;
        Some((leader, self.install_response(false, true, self.log.base_index())))
    }

    /// Accept a fact that reached quorum elsewhere and return its log index.
    ///
    /// A forward from an older term is still taken: the fact already reached
    /// quorum. Resends are idempotent, a fact already in the ledger or in the
    /// log is not appended twice.
    pub fn handle_forward_proposal(&mut self, term: Term, payload: String) -> Result<u64, ConsensusError> {
        self.observe_term(term);
        if let Err(err) = self.check_term(term) {
            debug!(node_id = %self.id, term, %err, "forwarded fact from an older term");
        }
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader {
                leader_hint: self.leader_id.clone(),
            });
        }
        if let Some(index) = self.fact_index(&payload) {
            debug!(node_id = %self.id, index, payload = %payload, "forwarded fact already recorded");
            return Ok(index);
        }
        self.append_entry(payload).map(|entry| entry.index)
    }

    /// Whether `payload` is in the ledger or in a committed log entry
    pub fn fact_committed(&self, payload: &str) -> bool {
        self.applied.contains(payload)
            || self
                .log
                .entries_from(self.last_applied + 1, usize::MAX)
                .iter()
                .any(|e| e.index <= self.commit_index && e.payload == payload)
    }

    /// Where a recorded fact sits: its log entry, or the applied index once
    /// it has been folded into the ledger. Uncommitted entries from older
    /// terms do not count, they may still be overwritten.
    fn fact_index(&self, payload: &str) -> Option<u64> {
        let in_log = self
            .log
            .entries_from(self.log.base_index() + 1, usize::MAX)
            .into_iter()
            .find(|e| e.payload == payload && (e.term == self.current_term || e.index <= self.commit_index))
            .map(|e| e.index);
        in_log.or_else(|| self.applied.contains(payload).then_some(self.last_applied))
    }

    /// Where a quorum-reached fact must go: None when this node is the
    /// leader, Some(leader) when one is known, Err when nobody leads.
    pub fn forward_target(&self) -> Result<Option<NodeId>, ConsensusError> {
        if self.is_leader() {
            return Ok(None);
        }
        match &self.leader_id {
            Some(leader) => Ok(Some(leader.clone())),
            None => Err(ConsensusError::NotLeader { leader_hint: None }),
        }
    }

    fn append_response(&self, success: bool, match_index: u64) -> RaftMessage {
        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
        }
    }

    fn install_response(&self, success: bool, retransfer: bool, last_included_index: u64) -> RaftMessage {
        RaftMessage::InstallSnapshotResponse {
            term: self.current_term,
            success,
            retransfer,
            last_included_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{LogEntry, RaftMessage, RaftNode};

    fn leader_of_three() -> RaftNode {
        let mut node = RaftNode::new("n1", vec!["n1".into(), "n2".into(), "n3".into()]);
        node.start_election();
        node.handle_vote_response(1, true, "n2");
        node
    }

    #[test]
    fn lagging_follower_gets_snapshot_after_compaction() {
        let mut node = leader_of_three();
        for i in 0..3 {
            node.append_entry(format!("f{i}")).unwrap();
        }
        node.handle_append_entries_response(1, true, "n2", 3);
        node.snapshot_state();
        assert_eq!(node.log.base_index(), 3);

        match node.create_append_entries("n3").unwrap() {
            RaftMessage::InstallSnapshot { snapshot, .. } => {
                assert_eq!(snapshot.last_included_index, 3);
                assert_eq!(snapshot.state.facts.len(), 3);
            }
            other => panic!("expected InstallSnapshot, got {other:?}"),
        }
    }

    #[test]
    fn retransfer_request_resets_next_index_to_base() {
        let mut node = leader_of_three();
        node.append_entry("f1").unwrap();
        node.handle_append_entries_response(1, true, "n2", 1);
        node.snapshot_state();
        node.next_index.insert("n3".into(), 2);

        node.handle_install_snapshot_response(1, false, true, "n3", 1);

        assert_eq!(node.next_index.get("n3"), Some(&1));
        assert!(matches!(
            node.create_append_entries("n3"),
            Some(RaftMessage::InstallSnapshot { .. })
        ));
    }

    #[test]
    fn retransfer_without_snapshot_takes_one() {
        let mut node = leader_of_three();
        node.append_entry("f1").unwrap();
        node.handle_append_entries_response(1, true, "n2", 1);
        assert!(node.snapshot.is_none());

        node.handle_install_snapshot_response(1, false, true, "n3", 0);

        match node.create_append_entries("n3") {
            Some(RaftMessage::InstallSnapshot { snapshot, .. }) => {
                assert_eq!(snapshot.last_included_index, 1);
                assert_eq!(snapshot.state.facts, vec!["f1".to_string()]);
            }
            other => panic!("expected InstallSnapshot, got {other:?}"),
        }

        node.handle_install_snapshot_response(1, true, false, "n3", 1);
        assert!(matches!(
            node.create_append_entries("n3"),
            Some(RaftMessage::AppendEntries { prev_log_index: 1, .. })
        ));
    }

    #[test]
    fn forwarded_fact_is_appended_once() {
        let mut node = leader_of_three();
        let first = node.handle_forward_proposal(0, "f1".into()).unwrap();
        let again = node.handle_forward_proposal(1, "f1".into()).unwrap();

        assert_eq!(first, 1);
        assert_eq!(again, 1);
        assert_eq!(node.log.len(), 1);
        assert!(!node.fact_committed("f1"));

        node.handle_append_entries_response(1, true, "n2", 1);
        assert!(node.fact_committed("f1"));
    }

    #[test]
    fn forward_to_follower_is_refused() {
        let mut node = RaftNode::new("n2", vec!["n1".into(), "n2".into(), "n3".into()]);
        assert!(node.handle_forward_proposal(3, "f1".into()).is_err());
        assert_eq!(node.current_term, 3);
        assert!(node.log.is_empty());
    }

    #[test]
    fn accept_entry_is_idempotent_for_duplicates() {
        let mut node = RaftNode::new("n2", vec!["n1".into(), "n2".into(), "n3".into()]);
        let entry = LogEntry::new(1, 1, "f1");

        let (first, _) = node.accept_entry(1, "n1", entry.clone());
        let (second, _) = node.accept_entry(1, "n1", entry);

        for resp in [first, second] {
            assert!(matches!(resp, RaftMessage::AppendEntriesResponse { success: true, .. }));
        }
        assert_eq!(node.log.len(), 1);
    }
}
