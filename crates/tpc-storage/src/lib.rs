//! # tpc-storage
//!
//! why: provide durable persistence for the participant log and local key-value storage
//! relations: used by tpc-node's participant server; entries and replay come from tpc-core
//! what: LogStorage trait, FileStorage and InMemoryStorage, WriteAheadLog, KvCache, KvStore

pub mod cache;
pub mod store;
pub mod wal;

pub use cache::KvCache;
pub use store::{KeyValueStore, KvStore};
pub use wal::WriteAheadLog;

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tpc_core::LogEntry;

/// trait for durable storage of the participant log
///
/// this abstraction allows the same code to work with:
/// - real filesystem (native)
/// - in-memory (testing)
pub trait LogStorage {
    /// append entries to the log, durable before returning
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> io::Result<()>;
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// the whole log is one json array, rewritten on every append and swapped
/// into place with a rename so a crash leaves either the old or the new log
pub struct FileStorage {
    /// directory holding the log file
    dir: PathBuf,
    /// log file name inside `dir`
    file_name: String,
}

impl FileStorage {
    /// create a new filestorage at the given directory, using `log.json`
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_file_name(dir, "log.json")
    }

    /// like `new`, with an explicit log file name
    pub fn with_file_name(dir: impl Into<PathBuf>, file_name: impl Into<String>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            file_name: file_name.into(),
        })
    }

    /// log file for a participant: `<id>@<host>.log.json`
    pub fn for_participant(dir: impl Into<PathBuf>, id: u64, host: &str) -> io::Result<Self> {
        Self::with_file_name(dir, format!("{id}@{host}.log.json"))
    }

    /// get the path to the log file
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    fn write_log(&self, log: &[LogEntry]) -> io::Result<()> {
        let json = serde_json::to_string_pretty(log)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join(format!("{}.tmp", self.file_name));
        write_synced(&temp_path, json.as_bytes())?;
        fs::rename(&temp_path, self.log_path())?;

        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

impl LogStorage for FileStorage {
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        // load existing log
        let mut log = self.load_log()?;

        // append new entries
        log.extend(entries.iter().cloned());

        self.write_log(&log)
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut file = File::open(&path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let log: Vec<LogEntry> = serde_json::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(log)
    }

    fn clear(&mut self) -> io::Result<()> {
        match fs::remove_file(self.log_path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Default, Clone)]
pub struct InMemoryStorage {
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// start from an existing log, as if it had been read back after a crash
    pub fn with_entries(log: Vec<LogEntry>) -> Self {
        Self { log }
    }
}

impl LogStorage for InMemoryStorage {
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.log.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tpc_core::{Message, Phase};

    fn ready(id: &str) -> LogEntry {
        LogEntry::new(
            Phase::VotedReady,
            Message::put_request("key1", "value1").with_tpc_op_id(id),
        )
    }

    #[test]
    fn in_memory_storage_appends_and_loads_log() {
        let mut storage = InMemoryStorage::new();

        storage
            .append_entries(&[ready("1"), LogEntry::new(Phase::Committed, Message::commit("1"))])
            .unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].phase, Phase::VotedReady);
        assert_eq!(log[1].phase, Phase::Committed);
    }

    #[test]
    fn file_storage_appends_and_loads_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&[ready("1")]).unwrap();
        storage.append_entries(&[ready("2")]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].tpc_op_id(), Some("2"));
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut storage = FileStorage::for_participant(dir.path(), 10, "localhost").unwrap();
            storage.append_entries(&[ready("1")]).unwrap();
        }

        // "restart" - new storage instance
        {
            let storage = FileStorage::for_participant(dir.path(), 10, "localhost").unwrap();
            let log = storage.load_log().unwrap();
            assert_eq!(log, vec![ready("1")]);
        }
    }

    #[test]
    fn file_storage_clear_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.clear().unwrap();
        storage.append_entries(&[ready("1")]).unwrap();
        storage.clear().unwrap();

        assert!(storage.load_log().unwrap().is_empty());
    }
}
