//! # participant
//!
//! why: a replica that votes in 2PC, persists every vote and decision, and survives restarts
//! relations: ParticipantState (tpc-core) decides, WriteAheadLog and KvStore (tpc-storage) persist
//! what: Participant, ParticipantHandler, ParticipantServer, register_with_master

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use tpc_core::{
    KvError, Message, MessageType, ParticipantInfo, ParticipantState, Phase, TxnState,
};
use tpc_storage::{FileStorage, KeyValueStore, KvStore, LogStorage, WriteAheadLog};

use crate::config::ParticipantConfig;
use crate::server::{NetworkHandler, SocketServer};
use crate::wire::{self, Connection};

/// One replica's protocol state, log and data.
pub struct Participant<S: LogStorage> {
    id: u64,
    state: Mutex<ParticipantState>,
    wal: Mutex<WriteAheadLog<S>>,
    store: Arc<dyn KeyValueStore>,
}

impl<S: LogStorage + Send> Participant<S> {
    /// Rebuilds `store` from the log and re-arms any vote left undecided by a crash.
    pub fn recover(id: u64, storage: S, store: Arc<dyn KeyValueStore>) -> Result<Self, KvError> {
        let mut wal = WriteAheadLog::new(storage);
        let applied = wal.rebuild(store.as_ref())?;

        let mut state = ParticipantState::new();
        if let Some(request) = wal.take_interrupted() {
            info!(
                participant = id,
                tpc_op_id = request.tpc_op_id.as_deref().unwrap_or("?"),
                "resuming interrupted transaction, waiting for the decision"
            );
            state.restore(request);
        }
        info!(participant = id, applied, entries = wal.len(), "participant recovered");

        Ok(Self {
            id,
            state: Mutex::new(state),
            wal: Mutex::new(wal),
            store,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    pub fn status(&self, tpc_op_id: &str) -> TxnState {
        lock(&self.state).status(tpc_op_id)
    }

    /// Votes or decisions still waiting for the other phase.
    pub fn pending(&self) -> usize {
        lock(&self.state).pending_len()
    }

    pub fn log_len(&self) -> usize {
        lock(&self.wal).len()
    }

    /// Reply for any request this participant can receive.
    pub fn handle_message(&self, msg: &Message) -> Message {
        match msg.msg_type {
            MessageType::GetRequest => self.handle_get(msg),
            MessageType::PutRequest
            | MessageType::DeleteRequest
            | MessageType::Commit
            | MessageType::Abort => self.handle_tpc(msg),
            other => Message::failure(&KvError::Protocol(format!(
                "participant {} cannot serve {other:?}",
                self.id
            ))),
        }
    }

    fn handle_get(&self, msg: &Message) -> Message {
        let result = msg
            .require_key()
            .and_then(|key| self.store.get(key).map(|value| (key, value)));
        match result {
            Ok((key, value)) => Message::success(Some(key.to_string()), Some(value)),
            Err(err) => Message::failure(&err),
        }
    }

    /// Runs one protocol step: log, then apply, then reply.
    ///
    /// The state lock is held for the whole step, so steps on one participant
    /// never interleave and log order matches handling order.
    fn handle_tpc(&self, msg: &Message) -> Message {
        let mut state = lock(&self.state);
        let tpc_op_id = msg.tpc_op_id.clone().unwrap_or_default();
        if msg.is_decision() && state.status(&tpc_op_id) == TxnState::None {
            debug!(
                participant = self.id,
                tpc_op_id = %tpc_op_id,
                "no pending vote, acknowledging decision"
            );
        }

        let saved = state.checkpoint(&tpc_op_id);
        let step = state.handle(msg);

        if let Some(entry) = step.log {
            let phase = entry.phase;
            if let Err(err) = lock(&self.wal).append(entry) {
                error!(participant = self.id, tpc_op_id = %tpc_op_id, error = %err, "log write failed");
                state.rollback(saved);
                let err = KvError::Io(err);
                return match phase {
                    Phase::VotedReady => Message::abort(tpc_op_id).with_message(err.to_string()),
                    Phase::Committed | Phase::Aborted => {
                        Message::failure(&err).with_tpc_op_id(tpc_op_id)
                    }
                };
            }
            debug!(participant = self.id, tpc_op_id = %tpc_op_id, ?phase, "logged");
        }

        if let Some(mutation) = step.apply {
            if let Err(err) = self.store.apply(&mutation) {
                error!(participant = self.id, tpc_op_id = %tpc_op_id, error = %err, "apply failed");
                state.retry_later(&tpc_op_id, &mutation);
                return Message::failure(&KvError::Storage(err.to_string()))
                    .with_tpc_op_id(tpc_op_id);
            }
            info!(participant = self.id, tpc_op_id = %tpc_op_id, key = mutation.key(), "committed");
        }

        step.reply
    }
}

/// Serves coordinator connections: every message on a connection gets one reply.
pub struct ParticipantHandler<S: LogStorage> {
    participant: Arc<Participant<S>>,
    timeout: Duration,
}

impl<S: LogStorage> ParticipantHandler<S> {
    pub fn new(participant: Arc<Participant<S>>, timeout: Duration) -> Self {
        Self {
            participant,
            timeout,
        }
    }
}

impl<S: LogStorage + Send + 'static> NetworkHandler for ParticipantHandler<S> {
    fn handle(&self, mut conn: Connection) -> Result<()> {
        conn.set_timeout(Some(self.timeout))?;
        loop {
            let msg = match conn.recv() {
                Ok(Some(msg)) => msg,
                Ok(None) | Err(KvError::Timeout(_)) => break,
                Err(err @ KvError::Protocol(_)) => {
                    conn.send(&Message::failure(&err))?;
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            let reply = self.participant.handle_message(&msg);
            conn.send(&reply)?;
        }
        Ok(())
    }
}

/// Announces `info` to the coordinator, retrying until it answers with success.
pub fn register_with_master(
    info: &ParticipantInfo,
    master_addr: &str,
    timeout: Duration,
    attempts: usize,
) -> Result<(), KvError> {
    let request = Message::register(info.to_string());
    let mut last_err = KvError::Unavailable(format!("{master_addr} never answered"));
    for attempt in 1..=attempts.max(1) {
        match wire::call(master_addr, &request, timeout) {
            Ok(reply) if reply.msg_type == MessageType::Response && reply.is_success() => {
                info!(
                    participant = info.id,
                    reply = reply.message.as_deref().unwrap_or_default(),
                    "registered"
                );
                return Ok(());
            }
            Ok(reply) => {
                last_err = KvError::Protocol(format!(
                    "registration refused: {}",
                    reply.message.unwrap_or_default()
                ));
            }
            Err(err) => last_err = err,
        }
        warn!(participant = info.id, attempt, error = %last_err, "registration failed, retrying");
        thread::sleep(backoff(attempt));
    }
    Err(last_err)
}

fn backoff(attempt: usize) -> Duration {
    Duration::from_millis(100 * attempt.min(10) as u64)
}

/// A participant bound to a socket, with its log on disk.
pub struct ParticipantServer {
    info: ParticipantInfo,
    participant: Arc<Participant<FileStorage>>,
    server: SocketServer,
}

impl ParticipantServer {
    /// Recovers from `<log_dir>/<id>@<host>.log.json`, starts listening, then registers.
    pub fn start(config: ParticipantConfig) -> Result<Self> {
        let host = config
            .listen_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .with_context(|| format!("listen address {} has no port", config.listen_addr))?;

        let storage = FileStorage::for_participant(config.log_dir.clone(), config.id, &host)
            .with_context(|| format!("cannot open log directory {}", config.log_dir.display()))?;
        let store: Arc<dyn KeyValueStore> = Arc::new(KvStore::new(config.cache_capacity));
        let participant = Arc::new(
            Participant::recover(config.id, storage, store)
                .context("log replay failed")?,
        );

        let handler = Arc::new(ParticipantHandler::new(
            Arc::clone(&participant),
            config.timeout,
        ));
        let server = SocketServer::start(
            &format!("participant-{}", config.id),
            &config.listen_addr,
            config.workers,
            handler,
        )?;
        let info = ParticipantInfo::new(config.id, host, server.local_addr().port());

        if let Some(master) = &config.master_registration_addr {
            register_with_master(&info, master, config.timeout, config.registration_attempts)
                .with_context(|| format!("could not register {info} with {master}"))?;
        }

        Ok(Self {
            info,
            participant,
            server,
        })
    }

    pub fn info(&self) -> &ParticipantInfo {
        &self.info
    }

    pub fn participant(&self) -> &Participant<FileStorage> {
        &self.participant
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpc_core::LogEntry;
    use tpc_storage::InMemoryStorage;

    fn participant() -> Participant<InMemoryStorage> {
        Participant::recover(1, InMemoryStorage::new(), Arc::new(KvStore::new(10))).unwrap()
    }

    /// Store whose writes always fail.
    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<String, KvError> {
            Err(KvError::NotFound("Does not exist".into()))
        }
        fn put(&self, _key: &str, _value: &str) -> Result<(), KvError> {
            Err(KvError::Storage("disk full".into()))
        }
        fn delete(&self, _key: &str) -> Result<bool, KvError> {
            Err(KvError::Storage("disk full".into()))
        }
    }

    #[test]
    fn prepare_commit_applies_and_logs_twice() {
        let p = participant();

        let vote = p.handle_message(&Message::put_request("k", "v").with_tpc_op_id("1"));
        assert_eq!(vote, Message::ready("1"));
        assert!(p.store().get("k").is_err());

        let ack = p.handle_message(&Message::commit("1"));
        assert_eq!(ack, Message::ack("1"));
        assert_eq!(p.store().get("k").unwrap(), "v");
        assert_eq!(p.log_len(), 2);
    }

    #[test]
    fn abort_discards_the_vote() {
        let p = participant();
        p.handle_message(&Message::put_request("k", "v").with_tpc_op_id("1"));

        assert_eq!(p.handle_message(&Message::abort("1")), Message::ack("1"));
        assert!(p.store().get("k").is_err());
        assert_eq!(p.status("1"), TxnState::None);
        assert_eq!(p.log_len(), 2);
    }

    #[test]
    fn reused_id_after_commit_is_applied_again() {
        let p = participant();
        p.handle_message(&Message::put_request("k", "old").with_tpc_op_id("1"));
        p.handle_message(&Message::commit("1"));

        let vote = p.handle_message(&Message::put_request("k", "new").with_tpc_op_id("1"));
        assert_eq!(vote, Message::ready("1"));
        assert_eq!(p.handle_message(&Message::commit("1")), Message::ack("1"));

        assert_eq!(p.store().get("k").unwrap(), "new");
        assert_eq!(p.log_len(), 4);
    }

    #[test]
    fn repeated_commit_is_acked_once_applied() {
        let p = participant();
        p.handle_message(&Message::delete_request("k").with_tpc_op_id("1"));
        p.handle_message(&Message::commit("1"));

        assert_eq!(p.handle_message(&Message::commit("1")), Message::ack("1"));
        assert_eq!(p.log_len(), 2);
    }

    #[test]
    fn unknown_decision_is_acked_without_logging() {
        let p = participant();
        assert_eq!(p.handle_message(&Message::commit("77")), Message::ack("77"));
        assert_eq!(p.log_len(), 0);
    }

    #[test]
    fn get_reads_the_local_store() {
        let p = participant();
        p.handle_message(&Message::put_request("k", "v").with_tpc_op_id("1"));
        p.handle_message(&Message::commit("1"));

        let reply = p.handle_message(&Message::get_request("k"));
        assert!(reply.is_success());
        assert_eq!(reply.value.as_deref(), Some("v"));

        let missing = p.handle_message(&Message::get_request("nope"));
        assert!(!missing.is_success());
        assert_eq!(missing.message.as_deref(), Some("Does not exist"));
    }

    #[test]
    fn failed_apply_keeps_the_transaction_pending() {
        let p = Participant::recover(1, InMemoryStorage::new(), Arc::new(BrokenStore)).unwrap();
        p.handle_message(&Message::put_request("k", "v").with_tpc_op_id("1"));

        let reply = p.handle_message(&Message::commit("1"));

        assert!(!reply.is_success());
        assert_eq!(reply.tpc_op_id.as_deref(), Some("1"));
        assert_eq!(p.status("1"), TxnState::VotedReady);
        // commit already durable, so a retry must not log it again
        p.handle_message(&Message::commit("1"));
        assert_eq!(p.log_len(), 2);
    }

    #[test]
    fn recovery_resumes_an_interrupted_vote() {
        let storage = InMemoryStorage::with_entries(vec![
            LogEntry::new(Phase::VotedReady, Message::put_request("a", "1").with_tpc_op_id("1")),
            LogEntry::new(Phase::Committed, Message::commit("1")),
            LogEntry::new(Phase::VotedReady, Message::put_request("b", "2").with_tpc_op_id("2")),
        ]);
        let p = Participant::recover(1, storage, Arc::new(KvStore::new(10))).unwrap();

        assert_eq!(p.store().get("a").unwrap(), "1");
        assert_eq!(p.status("2"), TxnState::VotedReady);

        assert_eq!(p.handle_message(&Message::commit("2")), Message::ack("2"));
        assert_eq!(p.store().get("b").unwrap(), "2");
        assert_eq!(p.pending(), 0);
    }
}
