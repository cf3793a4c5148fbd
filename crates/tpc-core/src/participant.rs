//! # participant
//!
//! why: decide how a participant reacts to each 2PC message, independent of sockets and disks
//! relations: driven by tpc-node's participant server, which persists `Step::log` and applies `Step::apply`
//! what: TxnState, Step, ParticipantState transition function

use std::collections::HashMap;

use crate::error::KvError;
use crate::log::{LogEntry, Mutation, Phase};
use crate::message::{Message, MessageType};

/// Where one transaction stands from this participant's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Nothing outstanding: never prepared here, or already decided.
    None,
    VotedReady,
}

/// What the runtime must do, in order, for one incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Append this before doing anything else.
    pub log: Option<LogEntry>,
    /// Apply this to local storage after the log write.
    pub apply: Option<Mutation>,
    /// Send this back to the coordinator last.
    pub reply: Message,
}

impl Step {
    fn reply(reply: Message) -> Self {
        Self {
            log: None,
            apply: None,
            reply,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingTxn {
    request: Message,
    /// Set once a `Committed` entry is durable, so a retried apply does not log twice.
    commit_logged: bool,
}

/// Saved state of one transaction; see [`ParticipantState::checkpoint`].
#[derive(Debug, Clone)]
pub struct Checkpoint {
    tpc_op_id: String,
    pending: Option<PendingTxn>,
}

/// Per-participant transaction table. Only undecided votes are kept; a
/// transaction is forgotten as soon as its decision is logged.
#[derive(Debug, Default)]
pub struct ParticipantState {
    pending: HashMap<String, PendingTxn>,
}

impl ParticipantState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, tpc_op_id: &str) -> TxnState {
        if self.pending.contains_key(tpc_op_id) {
            TxnState::VotedReady
        } else {
            TxnState::None
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Re-arms a ready vote found dangling in the log after a restart.
    pub fn restore(&mut self, request: Message) {
        if let Some(id) = request.tpc_op_id.clone() {
            self.pending.insert(
                id,
                PendingTxn {
                    request,
                    commit_logged: false,
                },
            );
        }
    }

    /// Captures everything known about one transaction, so a step whose
    /// log write fails can be undone with `rollback`.
    pub fn checkpoint(&self, tpc_op_id: &str) -> Checkpoint {
        Checkpoint {
            tpc_op_id: tpc_op_id.to_string(),
            pending: self.pending.get(tpc_op_id).cloned(),
        }
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        let Checkpoint { tpc_op_id, pending } = checkpoint;
        match pending {
            Some(txn) => self.pending.insert(tpc_op_id, txn),
            None => self.pending.remove(&tpc_op_id),
        };
    }

    /// Puts a committed transaction back after its apply failed.
    ///
    /// The commit is already durable; the next commit delivery re-applies
    /// without writing another entry.
    pub fn retry_later(&mut self, tpc_op_id: &str, mutation: &Mutation) {
        let request = match mutation {
            Mutation::Put { key, value } => Message::put_request(key.clone(), value.clone()),
            Mutation::Delete { key } => Message::delete_request(key.clone()),
        };
        self.pending.insert(
            tpc_op_id.to_string(),
            PendingTxn {
                request: request.with_tpc_op_id(tpc_op_id),
                commit_logged: true,
            },
        );
    }

    /// The transition function: current state plus one message.
    pub fn handle(&mut self, msg: &Message) -> Step {
        let Some(id) = msg.tpc_op_id.clone() else {
            return Step::reply(Message::failure(&KvError::Protocol(format!(
                "{:?} without a TPCOpId",
                msg.msg_type
            ))));
        };

        match msg.msg_type {
            MessageType::PutRequest | MessageType::DeleteRequest => self.prepare(id, msg),
            MessageType::Commit => self.commit(id, msg),
            MessageType::Abort => self.abort(id, msg),
            other => Step::reply(Message::failure(&KvError::Protocol(format!(
                "unexpected {other:?} in two-phase commit"
            )))),
        }
    }

    fn prepare(&mut self, id: String, msg: &Message) -> Step {
        // a resent prepare for the vote already on disk
        if self
            .pending
            .get(&id)
            .is_some_and(|txn| same_operation(&txn.request, msg))
        {
            return Step::reply(Message::ready(id));
        }

        if let Err(err) = msg.validate() {
            return Step::reply(Message::abort(id).with_message(err.to_string()));
        }

        self.pending.insert(
            id.clone(),
            PendingTxn {
                request: msg.clone(),
                commit_logged: false,
            },
        );
        Step {
            log: Some(LogEntry::new(Phase::VotedReady, msg.clone())),
            apply: None,
            reply: Message::ready(id),
        }
    }

    fn commit(&mut self, id: String, msg: &Message) -> Step {
        let Some(txn) = self.pending.remove(&id) else {
            // already decided, or never prepared here: acknowledge without touching storage
            return Step::reply(Message::ack(id));
        };

        let log = (!txn.commit_logged).then(|| LogEntry::new(Phase::Committed, msg.clone()));
        match Mutation::from_message(&txn.request) {
            Ok(mutation) => Step {
                log,
                apply: Some(mutation),
                reply: Message::ack(id),
            },
            Err(err) => Step {
                log,
                apply: None,
                reply: Message::failure(&err).with_tpc_op_id(id),
            },
        }
    }

    fn abort(&mut self, id: String, msg: &Message) -> Step {
        match self.pending.remove(&id) {
            Some(_) => Step {
                log: Some(LogEntry::new(Phase::Aborted, msg.clone())),
                apply: None,
                reply: Message::ack(id),
            },
            None => Step::reply(Message::ack(id)),
        }
    }
}

fn same_operation(a: &Message, b: &Message) -> bool {
    a.msg_type == b.msg_type && a.key == b.key && a.value == b.value
}
