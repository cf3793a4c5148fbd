//! # comprehensive storage tests
//!
//! why: verify the participant log and local store behave across restarts
//! relations: tests tpc-storage crate
//! what: log persistence, crash recovery, interrupted operations, store semantics

use tempfile::tempdir;
use tpc_core::{LogEntry, Message, MessageType, Phase};
use tpc_storage::{FileStorage, InMemoryStorage, KeyValueStore, KvStore, LogStorage, WriteAheadLog};
use std::fs;

fn ready(id: &str, msg: Message) -> LogEntry {
    LogEntry::new(Phase::VotedReady, msg.with_tpc_op_id(id))
}

fn committed(id: &str) -> LogEntry {
    LogEntry::new(Phase::Committed, Message::commit(id))
}

fn aborted(id: &str) -> LogEntry {
    LogEntry::new(Phase::Aborted, Message::abort(id))
}

// =============================================================================
// SECTION 1: IN-MEMORY STORAGE TESTS
// =============================================================================

mod in_memory_log {
    use super::*;

    #[test]
    fn new_storage_has_empty_log() {
        let storage = InMemoryStorage::new();
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn append_in_batches() {
        let mut storage = InMemoryStorage::new();

        storage.append_entries(&[ready("1", Message::put_request("a", "1"))]).unwrap();
        storage.append_entries(&[committed("1")]).unwrap();
        storage.append_entries(&[]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].phase, Phase::Committed);
    }

    #[test]
    fn clear_resets_log() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&[committed("1")]).unwrap();

        storage.clear().unwrap();

        assert!(storage.load_log().unwrap().is_empty());
    }
}

// =============================================================================
// SECTION 2: FILE STORAGE TESTS
// =============================================================================

mod file_storage {
    use super::*;

    #[test]
    fn create_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tpc_logs");

        FileStorage::new(&path).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn participant_log_is_named_after_id_and_host() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::for_participant(dir.path(), 42, "localhost").unwrap();

        storage.append_entries(&[committed("1")]).unwrap();

        assert!(dir.path().join("42@localhost.log.json").exists());
        assert!(!dir.path().join("42@localhost.log.json.tmp").exists());
    }

    #[test]
    fn log_file_is_human_readable_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&[ready("9", Message::put_request("key", "value"))]).unwrap();

        let text = fs::read_to_string(storage.log_path()).unwrap();
        assert!(text.contains("\"VotedReady\""));
        assert!(text.contains("\"TPCOpId\": \"9\""));
    }

    #[test]
    fn corrupt_log_is_an_error_not_an_empty_log() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        fs::write(storage.log_path(), "{ not json").unwrap();

        assert!(storage.load_log().is_err());
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn log_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut wal = WriteAheadLog::new(FileStorage::new(dir.path()).unwrap());
            wal.append(ready("1", Message::put_request("k1", "v1"))).unwrap();
            wal.append(committed("1")).unwrap();
        }

        // "restart"
        {
            let mut wal = WriteAheadLog::new(FileStorage::new(dir.path()).unwrap());
            assert!(wal.is_empty());
            assert_eq!(wal.load().unwrap().len(), 2);
            assert!(!wal.is_empty());
        }
    }

    #[test]
    fn rebuild_replays_committed_put_and_reports_pending_delete() {
        let storage = InMemoryStorage::with_entries(vec![
            ready("1", Message::put_request("k1", "v1")),
            committed("1"),
            ready("2", Message::delete_request("k1")),
        ]);
        let mut wal = WriteAheadLog::new(storage);
        let store = KvStore::new(10);

        let applied = wal.rebuild(&store).unwrap();

        assert_eq!(applied, 1);
        // the delete has not been decided, so the put is still visible
        assert_eq!(store.get("k1").unwrap(), "v1");

        let interrupted = wal.take_interrupted().unwrap();
        assert_eq!(interrupted.msg_type, MessageType::DeleteRequest);
        assert_eq!(interrupted.tpc_op_id.as_deref(), Some("2"));
        assert!(wal.take_interrupted().is_none());
    }

    #[test]
    fn rebuild_last_write_wins() {
        let storage = InMemoryStorage::with_entries(vec![
            ready("1", Message::put_request("k", "first")),
            committed("1"),
            ready("2", Message::put_request("k", "second")),
            committed("2"),
            ready("3", Message::put_request("gone", "x")),
            committed("3"),
            ready("4", Message::delete_request("gone")),
            committed("4"),
        ]);
        let mut wal = WriteAheadLog::new(storage);
        let store = KvStore::new(10);

        wal.rebuild(&store).unwrap();

        assert_eq!(store.get("k").unwrap(), "second");
        assert!(store.get("gone").is_err());
        assert!(!wal.has_interrupted());
    }

    #[test]
    fn aborted_transactions_leave_no_trace() {
        let storage = InMemoryStorage::with_entries(vec![
            ready("1", Message::put_request("k", "v")),
            aborted("1"),
        ]);
        let mut wal = WriteAheadLog::new(storage);
        let store = KvStore::new(10);

        assert_eq!(wal.rebuild(&store).unwrap(), 0);
        assert!(store.is_empty());
        assert!(!wal.has_interrupted());
    }

    #[test]
    fn rebuild_from_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::new(FileStorage::new(dir.path()).unwrap());
        let store = KvStore::new(10);

        assert_eq!(wal.rebuild(&store).unwrap(), 0);
        assert!(wal.is_empty());
    }
}

// =============================================================================
// SECTION 4: LOCAL STORE TESTS
// =============================================================================

mod local_store {
    use super::*;

    #[test]
    fn put_overwrites() {
        let store = KvStore::new(2);
        store.put("k", "a").unwrap();
        store.put("k", "b").unwrap();
        assert_eq!(store.get("k").unwrap(), "b");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn snapshot_reflects_backing_map() {
        let store = KvStore::new(0);
        store.put("b", "2").unwrap();
        store.put("a", "1").unwrap();

        let keys: Vec<_> = store.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
