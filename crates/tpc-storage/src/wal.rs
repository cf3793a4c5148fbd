//! # wal
//!
//! why: make a participant's votes and decisions survive a crash
//! relations: wraps a LogStorage; replays into a KeyValueStore via tpc_core::replay
//! what: WriteAheadLog with append, load, rebuild and the interrupted-operation slot

use std::io;

use tracing::{debug, info};

use tpc_core::{replay, KvError, LogEntry, Message};

use crate::store::KeyValueStore;
use crate::LogStorage;

/// Append-only log of protocol messages for one participant.
pub struct WriteAheadLog<S: LogStorage> {
    storage: S,
    entries: Vec<LogEntry>,
    /// Ready vote with no recorded decision, found by the last `load`.
    interrupted: Option<Message>,
}

impl<S: LogStorage> WriteAheadLog<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            entries: Vec::new(),
            interrupted: None,
        }
    }

    /// Reads the full log back from storage and recomputes the interrupted slot.
    pub fn load(&mut self) -> io::Result<&[LogEntry]> {
        self.entries = self.storage.load_log()?;
        self.interrupted = replay(&self.entries).interrupted;
        debug!(entries = self.entries.len(), "log loaded");
        Ok(&self.entries)
    }

    /// Persists `entry`; it is durable once this returns `Ok`.
    pub fn append(&mut self, entry: LogEntry) -> io::Result<()> {
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_interrupted(&self) -> bool {
        self.interrupted.is_some()
    }

    /// The interrupted prepare, handed out exactly once.
    pub fn take_interrupted(&mut self) -> Option<Message> {
        self.interrupted.take()
    }

    /// Loads the log and replays every committed mutation into `store`.
    ///
    /// Returns the number of mutations applied. The interrupted slot is left
    /// for the caller to collect with `take_interrupted`.
    pub fn rebuild(&mut self, store: &dyn KeyValueStore) -> Result<usize, KvError> {
        self.load()?;
        let replayed = replay(&self.entries);
        for mutation in &replayed.mutations {
            store.apply(mutation)?;
        }
        info!(
            entries = self.entries.len(),
            applied = replayed.mutations.len(),
            interrupted = self.interrupted.is_some(),
            "log replayed"
        );
        Ok(replayed.mutations.len())
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;
    use tpc_core::Phase;

    #[test]
    fn append_is_visible_to_a_fresh_load() {
        let mut wal = WriteAheadLog::new(InMemoryStorage::new());
        wal.append(LogEntry::new(Phase::Aborted, Message::abort("1")))
            .unwrap();

        let storage = wal.storage().clone();
        let mut reopened = WriteAheadLog::new(storage);
        assert_eq!(reopened.load().unwrap().len(), 1);
    }

    #[test]
    fn interrupted_is_consumed_once() {
        let storage = InMemoryStorage::with_entries(vec![LogEntry::new(
            Phase::VotedReady,
            Message::delete_request("k").with_tpc_op_id("3"),
        )]);
        let mut wal = WriteAheadLog::new(storage);
        wal.load().unwrap();

        assert!(wal.has_interrupted());
        assert!(wal.take_interrupted().is_some());
        assert!(wal.take_interrupted().is_none());
    }
}
