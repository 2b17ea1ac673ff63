//! # log
//!
//! why: hold the append-only record of proposed facts that raft replicates
//! relations: owned by node.rs, persisted via concord-storage, compacted by snapshots
//! what: LogEntry struct, Log store with a compaction base, consistency lookups

use serde::{Deserialize, Serialize};

use crate::error::ConsensusError;
use crate::Term;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The fact identifier (or narrative payload) being recorded
    pub payload: String,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: u64, payload: impl Into<String>) -> Self {
        Self {
            term,
            index,
            payload: payload.into(),
        }
    }
}

/// Ordered, gap-free log.
///
/// Entries at or below `base_index` have been folded into a snapshot and are
/// no longer retained; `base_term` remembers the term of the last folded entry
/// so consistency checks against it still succeed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Log {
    entries: Vec<LogEntry>,
    base_index: u64,
    base_term: Term,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last entry folded into a snapshot (0 if none)
    pub fn base_index(&self) -> u64 {
        self.base_index
    }

    pub fn base_term(&self) -> Term {
        self.base_term
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map_or(self.base_index, |e| e.index)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(self.base_term, |e| e.term)
    }

    /// Number of retained (uncompacted) entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index <= self.base_index || index > self.last_index() {
            return None;
        }
        Some((index - self.base_index - 1) as usize)
    }

    /// Retained entry at `index`
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.position(index).map(|pos| &self.entries[pos])
    }

    /// Term of the entry at `index`.
    ///
    /// Index 0 is the empty prefix (term 0) and the compaction base answers
    /// with `base_term`. Compacted or missing positions return `None`.
    pub fn term_at(&self, index: u64) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Append one entry; it must extend the log contiguously.
    pub fn append(&mut self, entry: LogEntry) -> Result<(), ConsensusError> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(ConsensusError::LogGap {
                expected,
                got: entry.index,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Drop every entry at or after `from_index`
    pub fn truncate_from(&mut self, from_index: u64) {
        let keep = from_index.saturating_sub(self.base_index + 1) as usize;
        self.entries.truncate(keep);
    }

    /// Clone of the retained entries starting at `from_index`, at most `max` of them
    pub fn entries_from(&self, from_index: u64, max: usize) -> Vec<LogEntry> {
        let start = from_index.max(self.base_index + 1);
        match self.position(start) {
            Some(pos) => self.entries[pos..].iter().take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Discard entries up to and including `index`, which becomes the new base.
    ///
    /// Entries after `index` are kept. Compacting at or below the current base
    /// is a no-op.
    pub fn compact_to(&mut self, index: u64, term: Term) {
        if index <= self.base_index {
            return;
        }
        let drop = (index.min(self.last_index()) - self.base_index) as usize;
        self.entries.drain(..drop);
        self.base_index = index;
        self.base_term = term;
    }

    /// Replace the whole log with an empty one based at `index`/`term`
    pub fn reset_to(&mut self, index: u64, term: Term) {
        self.entries.clear();
        self.base_index = index;
        self.base_term = term;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(n: u64) -> Log {
        let mut log = Log::new();
        for i in 1..=n {
            log.append(LogEntry::new(1, i, format!("fact-{i}"))).unwrap();
        }
        log
    }

    #[test]
    fn empty_log_answers_index_zero() {
        let log = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn append_rejects_gaps() {
        let mut log = log_with(2);
        let err = log.append(LogEntry::new(1, 4, "x")).unwrap_err();
        assert_eq!(err, ConsensusError::LogGap { expected: 3, got: 4 });
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn compaction_keeps_suffix_and_base_term() {
        let mut log = log_with(5);
        log.compact_to(3, 1);

        assert_eq!(log.base_index(), 3);
        assert_eq!(log.len(), 2);
        assert_eq!(log.term_at(3), Some(1));
        assert!(log.get(3).is_none());
        assert_eq!(log.get(4).unwrap().payload, "fact-4");
        assert_eq!(log.last_index(), 5);
    }

    #[test]
    fn compaction_past_end_empties_log() {
        let mut log = log_with(2);
        log.compact_to(2, 1);
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);

        log.append(LogEntry::new(2, 3, "next")).unwrap();
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn truncate_after_compaction() {
        let mut log = log_with(6);
        log.compact_to(2, 1);
        log.truncate_from(5);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn entries_from_caps_batch() {
        let log = log_with(10);
        let batch = log.entries_from(4, 3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].index, 4);
        assert!(log.entries_from(11, 5).is_empty());
    }
}
