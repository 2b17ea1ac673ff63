//! # concord-storage
//!
//! why: keep a node's vote, log and snapshot across restarts
//! relations: written by concord-federation's node actor, read back into RaftNode::restore
//! what: Storage trait, FileStorage (json files, atomic rename), InMemoryStorage for tests

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use concord_core::{LogEntry, NodeId, Snapshot, Term};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt {file}: {source}")]
    Corrupt {
        file: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable storage for the state a node must not forget.
///
/// Implementations:
/// - [`FileStorage`] for real nodes
/// - [`InMemoryStorage`] for tests and diskless nodes
pub trait Storage: Send + Sync {
    /// Persist the current term and the vote cast in it
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<&str>) -> Result<()>;

    /// Load the persisted term and vote; `(0, None)` for a fresh node
    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>)>;

    /// Append entries to the log. Stored entries at or after the first new
    /// index are replaced.
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Load every stored log entry in index order
    fn load_log(&self) -> Result<Vec<LogEntry>>;

    /// Drop entries from `from_index` on (conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> Result<()>;

    /// Drop entries up to and including `index` (compaction)
    fn compact_log_through(&mut self, index: u64) -> Result<()>;

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;

    fn load_snapshot(&self) -> Result<Option<Snapshot>>;

    /// Remove all persisted state
    fn clear(&mut self) -> Result<()>;
}

/// Splice `entries` onto `log`, replacing any overlap
fn splice(log: &mut Vec<LogEntry>, entries: &[LogEntry]) {
    if let Some(first) = entries.first() {
        log.retain(|e| e.index < first.index);
        log.extend(entries.iter().cloned());
    }
}

// -- file storage implementation --

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// File-based storage under one directory:
/// - meta.json: term and voted_for
/// - log.json: array of log entries
/// - snapshot.json: latest snapshot
///
/// Every write goes to a temp file that is synced and renamed over the
/// target, so a crash leaves either the old or the new file.
pub struct FileStorage {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize, Default)]
struct MetaData {
    term: Term,
    voted_for: Option<NodeId>,
}

impl FileStorage {
    /// Open storage at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn write_atomic<T: Serialize + ?Sized>(&self, file: &'static str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|source| StorageError::Corrupt { file, source })?;

        let temp_path = self.dir.join(format!("{file}.tmp"));
        let mut out = File::create(&temp_path)?;
        out.write_all(json.as_bytes())?;
        out.sync_all()?;
        fs::rename(&temp_path, self.dir.join(file))?;

        debug!(dir = %self.dir.display(), file, bytes = json.len(), "persisted");
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, file: &'static str) -> Result<Option<T>> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(None);
        }
        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StorageError::Corrupt { file, source })
    }
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<&str>) -> Result<()> {
        let meta = MetaData {
            term,
            voted_for: voted_for.map(str::to_string),
        };
        self.write_atomic(META_FILE, &meta)
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>)> {
        let meta: MetaData = self.read(META_FILE)?.unwrap_or_default();
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // whole-file rewrite; logs stay short because snapshots compact them
        let mut log = self.load_log()?;
        splice(&mut log, entries);
        self.write_atomic(LOG_FILE, &log)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        Ok(self.read(LOG_FILE)?.unwrap_or_default())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<()> {
        let mut log = self.load_log()?;
        log.retain(|e| e.index < from_index);
        self.write_atomic(LOG_FILE, &log)
    }

    fn compact_log_through(&mut self, index: u64) -> Result<()> {
        let mut log = self.load_log()?;
        log.retain(|e| e.index > index);
        self.write_atomic(LOG_FILE, &log)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.write_atomic(SNAPSHOT_FILE, snapshot)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        self.read(SNAPSHOT_FILE)
    }

    fn clear(&mut self) -> Result<()> {
        for file in [META_FILE, LOG_FILE, SNAPSHOT_FILE] {
            match fs::remove_file(self.dir.join(file)) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
        }
        Ok(())
    }
}

// -- in-memory storage implementation --

/// In-memory storage; nothing survives the process
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<&str>) -> Result<()> {
        self.term = term;
        self.voted_for = voted_for.map(str::to_string);
        Ok(())
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>)> {
        Ok((self.term, self.voted_for.clone()))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        splice(&mut self.log, entries);
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<()> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn compact_log_through(&mut self, index: u64) -> Result<()> {
        self.log.retain(|e| e.index > index);
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }

    fn clear(&mut self) -> Result<()> {
        *self = Self::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::AppliedState;
    use tempfile::tempdir;

    fn snapshot_of(facts: &[&str]) -> Snapshot {
        let mut state = AppliedState::new();
        for (i, fact) in facts.iter().enumerate() {
            state.apply(&LogEntry::new(1, i as u64 + 1, *fact));
        }
        Snapshot::capture(&state)
    }

    #[test]
    fn in_memory_storage_persists_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(5, Some("n2")).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();

        assert_eq!(term, 5);
        assert_eq!(voted_for.as_deref(), Some("n2"));
    }

    #[test]
    fn in_memory_append_replaces_overlap() {
        let mut storage = InMemoryStorage::new();
        storage
            .append_entries(&[LogEntry::new(1, 1, "a"), LogEntry::new(1, 2, "b")])
            .unwrap();
        storage.append_entries(&[LogEntry::new(2, 2, "c")]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log, vec![LogEntry::new(1, 1, "a"), LogEntry::new(2, 2, "c")]);
    }

    #[test]
    fn file_storage_persists_term_and_vote() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(7, Some("node-primary")).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();

        assert_eq!(term, 7);
        assert_eq!(voted_for.as_deref(), Some("node-primary"));
    }

    #[test]
    fn file_storage_compacts_and_keeps_snapshot() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let entries: Vec<LogEntry> = (1..=4).map(|i| LogEntry::new(1, i, format!("f{i}"))).collect();
        storage.append_entries(&entries).unwrap();

        let snapshot = snapshot_of(&["f1", "f2"]);
        storage.save_snapshot(&snapshot).unwrap();
        storage.compact_log_through(2).unwrap();

        let reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(reopened.load_snapshot().unwrap(), Some(snapshot));
        let indices: Vec<u64> = reopened.load_log().unwrap().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![3, 4]);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(META_FILE), "{not json").unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert!(matches!(
            storage.load_term_and_vote(),
            Err(StorageError::Corrupt { file: "meta.json", .. })
        ));
    }
}
