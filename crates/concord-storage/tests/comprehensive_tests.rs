//! # comprehensive storage tests
//!
//! why: verify that a node's durable state survives restarts intact
//! relations: tests concord-storage against concord-core types
//! what: persistence, crash recovery into RaftNode, snapshots, atomic writes, edge cases

use std::fs;

use concord_core::{AppliedState, LogEntry, RaftConfig, RaftNode, Snapshot};
use concord_storage::{FileStorage, InMemoryStorage, Storage};
use tempfile::tempdir;

fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
    range.map(|i| LogEntry::new(term, i, format!("fact-{i}"))).collect()
}

fn snapshot_through(n: u64) -> Snapshot {
    let mut state = AppliedState::new();
    for entry in entries(1..=n, 1) {
        state.apply(&entry);
    }
    Snapshot::capture(&state)
}

// =============================================================================
// SECTION 1: IN-MEMORY STORAGE TESTS
// =============================================================================

mod in_memory_basic {
    use super::*;

    #[test]
    fn new_storage_has_default_values() {
        let storage = InMemoryStorage::new();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();

        assert_eq!(term, 0);
        assert_eq!(voted_for, None);
        assert!(storage.load_log().unwrap().is_empty());
        assert!(storage.load_snapshot().unwrap().is_none());
    }

    #[test]
    fn overwrite_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(1, Some("n1")).unwrap();
        storage.save_term_and_vote(5, None).unwrap();

        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        assert_eq!(term, 5);
        assert_eq!(voted_for, None);
    }

    #[test]
    fn append_in_batches() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(1..=2, 1)).unwrap();
        storage.append_entries(&entries(3..=5, 1)).unwrap();
        storage.append_entries(&[]).unwrap();

        assert_eq!(storage.load_log().unwrap().len(), 5);
    }

    #[test]
    fn truncate_then_append_rewrites_suffix() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(1..=3, 1)).unwrap();

        storage.truncate_log_from(2).unwrap();
        storage.append_entries(&entries(2..=2, 2)).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].term, 2);
    }

    #[test]
    fn clear_resets_all_state() {
        let mut storage = InMemoryStorage::new();
        storage.save_term_and_vote(3, Some("n2")).unwrap();
        storage.append_entries(&entries(1..=3, 1)).unwrap();
        storage.save_snapshot(&snapshot_through(2)).unwrap();

        storage.clear().unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        assert!(storage.load_log().unwrap().is_empty());
        assert!(storage.load_snapshot().unwrap().is_none());
    }
}

// =============================================================================
// SECTION 2: FILE STORAGE TESTS
// =============================================================================

mod file_storage_basic {
    use super::*;

    #[test]
    fn create_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("node-a").join("state");

        let storage = FileStorage::new(&nested).unwrap();

        assert!(nested.is_dir());
        assert_eq!(storage.dir(), nested.as_path());
    }

    #[test]
    fn new_storage_has_default_values() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        assert!(storage.load_log().unwrap().is_empty());
        assert!(storage.load_snapshot().unwrap().is_none());
    }

    #[test]
    fn append_creates_log_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&entries(1..=1, 1)).unwrap();

        assert!(dir.path().join("log.json").exists());
    }

    #[test]
    fn duplicate_append_does_not_double_entries() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&entries(1..=3, 1)).unwrap();
        storage.append_entries(&entries(2..=3, 1)).unwrap();

        assert_eq!(storage.load_log().unwrap(), entries(1..=3, 1));
    }

    #[test]
    fn truncate_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(1..=3, 1)).unwrap();

        storage.truncate_log_from(2).unwrap();

        assert_eq!(storage.load_log().unwrap(), entries(1..=1, 1));
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY / PERSISTENCE TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    fn cluster() -> Vec<String> {
        vec!["n1".into(), "n2".into(), "n3".into()]
    }

    #[test]
    fn term_and_log_survive_restart() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(10, Some("n1")).unwrap();
            storage.append_entries(&entries(1..=2, 10)).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (10, Some("n1".into())));
        assert_eq!(storage.load_log().unwrap().len(), 2);
    }

    #[test]
    fn node_restores_from_persisted_state() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(4, Some("n2")).unwrap();
            storage.append_entries(&entries(1..=5, 1)).unwrap();
            storage.save_snapshot(&snapshot_through(3)).unwrap();
            storage.compact_log_through(3).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        let node = RaftNode::restore(
            "n1",
            cluster(),
            RaftConfig::default(),
            term,
            voted_for,
            storage.load_snapshot().unwrap(),
            storage.load_log().unwrap(),
        );

        assert_eq!(node.current_term, 4);
        assert_eq!(node.voted_for.as_deref(), Some("n2"));
        assert_eq!(node.log.base_index(), 3);
        assert_eq!(node.last_log_index(), 5);
        assert_eq!(node.last_applied, 3);
        assert_eq!(node.applied.facts.len(), 3);
    }

    #[test]
    fn restored_node_has_nothing_unpersisted() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(1..=3, 1)).unwrap();

        let node = RaftNode::restore(
            "n1",
            cluster(),
            RaftConfig::default(),
            1,
            None,
            None,
            storage.load_log().unwrap(),
        );

        assert!(node.unpersisted().is_none());
    }

    #[test]
    fn multiple_restarts_preserve_state() {
        let dir = tempdir().unwrap();
        for round in 1..=3u64 {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            let (term, _) = storage.load_term_and_vote().unwrap();
            assert_eq!(term, round - 1);
            storage.save_term_and_vote(round, None).unwrap();
            storage.append_entries(&entries(round..=round, round)).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_log().unwrap().len(), 3);
    }

    #[test]
    fn clear_removes_all_files() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_term_and_vote(2, None).unwrap();
        storage.append_entries(&entries(1..=1, 1)).unwrap();
        storage.save_snapshot(&snapshot_through(1)).unwrap();

        storage.clear().unwrap();
        storage.clear().unwrap();

        for file in ["meta.json", "log.json", "snapshot.json"] {
            assert!(!dir.path().join(file).exists(), "{file} left behind");
        }
    }
}

// =============================================================================
// SECTION 4: SNAPSHOT AND COMPACTION TESTS
// =============================================================================

mod snapshots {
    use super::*;

    #[test]
    fn snapshot_round_trips_with_valid_checksum() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let snapshot = snapshot_through(4);

        storage.save_snapshot(&snapshot).unwrap();
        let loaded = storage.load_snapshot().unwrap().unwrap();

        assert_eq!(loaded, snapshot);
        assert!(loaded.verify().is_ok());
    }

    #[test]
    fn newer_snapshot_replaces_older() {
        let mut storage = InMemoryStorage::new();
        storage.save_snapshot(&snapshot_through(2)).unwrap();
        storage.save_snapshot(&snapshot_through(5)).unwrap();

        let loaded = storage.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.last_included_index, 5);
    }

    #[test]
    fn compaction_beyond_log_end_empties_log() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(1..=3, 1)).unwrap();

        storage.compact_log_through(10).unwrap();

        assert!(storage.load_log().unwrap().is_empty());
    }
}

// =============================================================================
// SECTION 5: ATOMIC WRITE TESTS
// =============================================================================

mod atomic_writes {
    use super::*;

    #[test]
    fn files_are_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_term_and_vote(5, Some("n2")).unwrap();
        storage.append_entries(&entries(1..=1, 1)).unwrap();
        storage.save_snapshot(&snapshot_through(1)).unwrap();

        for file in ["meta.json", "log.json", "snapshot.json"] {
            let contents = fs::read_to_string(dir.path().join(file)).unwrap();
            let _: serde_json::Value = serde_json::from_str(&contents).expect("valid JSON");
        }
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some("n2")).unwrap();
        storage.append_entries(&entries(1..=1, 1)).unwrap();
        storage.save_snapshot(&snapshot_through(1)).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn truncated_log_file_is_an_error_not_an_empty_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(1..=2, 1)).unwrap();

        let path = dir.path().join("log.json");
        let contents = fs::read_to_string(&path).unwrap();
        fs::write(&path, &contents[..contents.len() / 2]).unwrap();

        assert!(storage.load_log().is_err());
    }
}

// =============================================================================
// SECTION 6: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn large_payload() {
        let mut storage = InMemoryStorage::new();
        let payload = "x".repeat(1024 * 1024);

        storage
            .append_entries(&[LogEntry::new(1, 1, payload.clone())])
            .unwrap();

        assert_eq!(storage.load_log().unwrap()[0].payload.len(), payload.len());
    }

    #[test]
    fn unicode_payload_and_node_id() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let payload = "der Ritter fiel 🗡";

        storage.save_term_and_vote(1, Some("knoten-ä")).unwrap();
        storage
            .append_entries(&[LogEntry::new(1, 1, payload)])
            .unwrap();

        assert_eq!(storage.load_log().unwrap()[0].payload, payload);
        assert_eq!(storage.load_term_and_vote().unwrap().1.as_deref(), Some("knoten-ä"));
    }

    #[test]
    fn very_high_term_and_index() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(u64::MAX, None).unwrap();
        storage
            .append_entries(&[LogEntry::new(u64::MAX, u64::MAX, "f")])
            .unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap().0, u64::MAX);
        assert_eq!(storage.load_log().unwrap()[0].index, u64::MAX);
    }
}

// =============================================================================
// SECTION 7: STORAGE TRAIT POLYMORPHISM
// =============================================================================

mod trait_polymorphism {
    use super::*;

    fn exercise(storage: &mut dyn Storage) {
        storage.save_term_and_vote(5, Some("n2")).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (5, Some("n2".into())));

        storage.append_entries(&entries(1..=3, 1)).unwrap();
        storage.truncate_log_from(3).unwrap();
        storage.compact_log_through(1).unwrap();
        let indices: Vec<u64> = storage.load_log().unwrap().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![2]);

        storage.clear().unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap().0, 0);
    }

    #[test]
    fn boxed_backends_are_interchangeable() {
        let dir = tempdir().unwrap();
        let backends: Vec<Box<dyn Storage>> = vec![
            Box::new(InMemoryStorage::new()),
            Box::new(FileStorage::new(dir.path()).unwrap()),
        ];
        for mut backend in backends {
            exercise(backend.as_mut());
        }
    }
}
