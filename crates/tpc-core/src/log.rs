//! # log
//!
//! why: describe what a participant writes ahead of acting, and how it is read back
//! relations: produced by participant.rs, persisted and reloaded by tpc-storage
//! what: Phase, LogEntry, Mutation, replay of a log into committed mutations

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};
use crate::message::{Message, MessageType};

/// The protocol step an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// The participant voted ready on the prepare carried in the entry.
    VotedReady,
    /// The coordinator's commit decision arrived.
    Committed,
    /// The coordinator's abort decision arrived.
    Aborted,
}

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub phase: Phase,
    /// The prepare request for `VotedReady`, the decision otherwise.
    pub message: Message,
}

impl LogEntry {
    /// Pairs a phase with the message that moved the transaction into it.
    pub fn new(phase: Phase, message: Message) -> Self {
        Self { phase, message }
    }

    pub fn tpc_op_id(&self) -> Option<&str> {
        self.message.tpc_op_id.as_deref()
    }
}

/// A storage change a committed transaction applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put { key: String, value: String },
    Delete { key: String },
}

impl Mutation {
    /// Extracts the mutation a put or delete request describes.
    pub fn from_message(msg: &Message) -> Result<Self> {
        match msg.msg_type {
            MessageType::PutRequest => Ok(Mutation::Put {
                key: msg.require_key()?.to_string(),
                value: msg.require_value()?.to_string(),
            }),
            MessageType::DeleteRequest => Ok(Mutation::Delete {
                key: msg.require_key()?.to_string(),
            }),
            other => Err(KvError::Protocol(format!(
                "{other:?} does not describe a mutation"
            ))),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => key,
        }
    }
}

/// Result of scanning a log from the start.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Replay {
    /// Committed mutations in log order.
    pub mutations: Vec<Mutation>,
    /// The most recent ready vote that never saw a decision.
    pub interrupted: Option<Message>,
}

/// Walks `entries` in order, pairing each ready vote with its decision.
pub fn replay(entries: &[LogEntry]) -> Replay {
    let mut voted: HashMap<&str, (usize, &Message)> = HashMap::new();
    let mut mutations = Vec::new();

    for (pos, entry) in entries.iter().enumerate() {
        let Some(id) = entry.tpc_op_id() else {
            continue;
        };
        match entry.phase {
            Phase::VotedReady => {
                voted.insert(id, (pos, &entry.message));
            }
            Phase::Committed => {
                if let Some((_, prepare)) = voted.remove(id) {
                    // a ready vote is only logged after validation, so this cannot fail
                    if let Ok(mutation) = Mutation::from_message(prepare) {
                        mutations.push(mutation);
                    }
                }
            }
            Phase::Aborted => {
                voted.remove(id);
            }
        }
    }

    let interrupted = voted
        .into_values()
        .max_by_key(|(pos, _)| *pos)
        .map(|(_, msg)| msg.clone());

    Replay {
        mutations,
        interrupted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(id: &str, msg: Message) -> LogEntry {
        LogEntry::new(Phase::VotedReady, msg.with_tpc_op_id(id))
    }

    #[test]
    fn aborted_votes_are_not_replayed() {
        let entries = vec![
            ready("1", Message::put_request("k", "v")),
            LogEntry::new(Phase::Aborted, Message::abort("1")),
        ];
        let replay = replay(&entries);
        assert!(replay.mutations.is_empty());
        assert!(replay.interrupted.is_none());
    }

    #[test]
    fn dangling_vote_is_interrupted() {
        let entries = vec![ready("4", Message::delete_request("k"))];
        let replay = replay(&entries);
        assert_eq!(replay.interrupted.unwrap().tpc_op_id.as_deref(), Some("4"));
    }

    #[test]
    fn reused_id_replays_each_committed_vote() {
        let entries = vec![
            ready("1", Message::put_request("k", "old")),
            LogEntry::new(Phase::Committed, Message::commit("1")),
            ready("1", Message::put_request("k", "new")),
            LogEntry::new(Phase::Committed, Message::commit("1")),
        ];
        let values: Vec<_> = replay(&entries)
            .mutations
            .into_iter()
            .map(|m| match m {
                Mutation::Put { value, .. } => value,
                Mutation::Delete { key } => key,
            })
            .collect();
        assert_eq!(values, vec!["old", "new"]);
    }

    #[test]
    fn mutation_from_non_request_is_an_error() {
        assert!(Mutation::from_message(&Message::ack("1")).is_err());
    }
}
