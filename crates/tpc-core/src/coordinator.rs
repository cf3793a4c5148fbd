//! # coordinator
//!
//! why: the 2PC state machine as pure transitions, so it can be tested without sockets
//! relations: driven by tpc-node's TpcMaster, which turns `Outgoing` into network sends
//! and feeds replies, timeouts and socket errors back in as `Event`s
//! what: Replica, Decision, Event, TpcPhase, TpcOperation

use crate::message::{Message, MessageType};

/// Which of the two replicas of a key a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Replica {
    Primary,
    Secondary,
}

impl Replica {
    pub const BOTH: [Replica; 2] = [Replica::Primary, Replica::Secondary];

    fn index(self) -> usize {
        match self {
            Replica::Primary => 0,
            Replica::Secondary => 1,
        }
    }
}

/// The binding outcome of phase 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Abort,
}

impl Decision {
    fn message(self, tpc_op_id: &str) -> Message {
        match self {
            Decision::Commit => Message::commit(tpc_op_id),
            Decision::Abort => Message::abort(tpc_op_id),
        }
    }
}

/// Something that happened on the connection to one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Reply(Message),
    /// No reply before the phase deadline.
    Timeout,
    /// Connect, write or read failed.
    IoError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpcPhase {
    /// Waiting for both votes; `None` means not heard from yet.
    Preparing { votes: [Option<bool>; 2] },
    /// Decision sent, waiting for both acks.
    Deciding { decision: Decision, acked: [bool; 2] },
    Done(Decision),
}

/// A message the driver must put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: Replica,
    pub message: Message,
}

/// One transaction from prepare to the last ack.
#[derive(Debug, Clone)]
pub struct TpcOperation {
    tpc_op_id: String,
    prepare: Message,
    phase: TpcPhase,
    veto: Option<(Replica, String)>,
}

impl TpcOperation {
    /// `request` is the client's put or delete; the id is stamped on.
    pub fn new(tpc_op_id: impl Into<String>, request: &Message) -> Self {
        let tpc_op_id = tpc_op_id.into();
        let prepare = Message {
            status: None,
            message: None,
            ..request.clone()
        }
        .with_tpc_op_id(tpc_op_id.clone());

        Self {
            tpc_op_id,
            prepare,
            phase: TpcPhase::Preparing {
                votes: [None, None],
            },
            veto: None,
        }
    }

    pub fn tpc_op_id(&self) -> &str {
        &self.tpc_op_id
    }

    pub fn phase(&self) -> &TpcPhase {
        &self.phase
    }

    pub fn prepare_message(&self) -> &Message {
        &self.prepare
    }

    /// The first reason a replica gave (or had) for not voting ready.
    pub fn veto(&self) -> Option<&(Replica, String)> {
        self.veto.as_ref()
    }

    pub fn decision(&self) -> Option<Decision> {
        match self.phase {
            TpcPhase::Preparing { .. } => None,
            TpcPhase::Deciding { decision, .. } | TpcPhase::Done(decision) => Some(decision),
        }
    }

    pub fn decision_message(&self) -> Option<Message> {
        self.decision().map(|d| d.message(&self.tpc_op_id))
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, TpcPhase::Done(_))
    }

    /// `Some(true)` once a commit is fully acknowledged, `Some(false)` for an abort.
    pub fn outcome(&self) -> Option<bool> {
        match self.phase {
            TpcPhase::Done(decision) => Some(decision == Decision::Commit),
            _ => None,
        }
    }

    /// Prepare messages for both replicas.
    pub fn start(&self) -> Vec<Outgoing> {
        Replica::BOTH
            .iter()
            .map(|&to| Outgoing {
                to,
                message: self.prepare.clone(),
            })
            .collect()
    }

    /// Feeds one event and returns what must be sent next.
    pub fn on_event(&mut self, from: Replica, event: Event) -> Vec<Outgoing> {
        match self.phase.clone() {
            TpcPhase::Preparing { mut votes } => {
                if votes[from.index()].is_some() {
                    return Vec::new();
                }
                let ready = match &event {
                    Event::Reply(msg) => {
                        msg.msg_type == MessageType::Ready && self.matches_id(msg)
                    }
                    Event::Timeout | Event::IoError(_) => false,
                };
                if !ready && self.veto.is_none() {
                    self.veto = Some((from, describe(&event)));
                }
                votes[from.index()] = Some(ready);

                match votes {
                    [Some(a), Some(b)] => {
                        let decision = if a && b {
                            Decision::Commit
                        } else {
                            Decision::Abort
                        };
                        self.phase = TpcPhase::Deciding {
                            decision,
                            acked: [false, false],
                        };
                        Replica::BOTH
                            .iter()
                            .map(|&to| Outgoing {
                                to,
                                message: decision.message(&self.tpc_op_id),
                            })
                            .collect()
                    }
                    _ => {
                        self.phase = TpcPhase::Preparing { votes };
                        Vec::new()
                    }
                }
            }
            TpcPhase::Deciding {
                decision,
                mut acked,
            } => {
                if acked[from.index()] {
                    return Vec::new();
                }
                let is_ack = matches!(
                    &event,
                    Event::Reply(msg) if msg.msg_type == MessageType::Ack && self.matches_id(msg)
                );
                if !is_ack {
                    // at-least-once: resend the identical decision
                    return vec![Outgoing {
                        to: from,
                        message: decision.message(&self.tpc_op_id),
                    }];
                }
                acked[from.index()] = true;
                self.phase = if acked == [true, true] {
                    TpcPhase::Done(decision)
                } else {
                    TpcPhase::Deciding { decision, acked }
                };
                Vec::new()
            }
            TpcPhase::Done(_) => Vec::new(),
        }
    }

    fn matches_id(&self, msg: &Message) -> bool {
        msg.tpc_op_id
            .as_deref()
            .map_or(true, |id| id == self.tpc_op_id)
    }
}

fn describe(event: &Event) -> String {
    match event {
        Event::Reply(msg) => msg
            .message
            .clone()
            .unwrap_or_else(|| format!("voted {:?}", msg.msg_type)),
        Event::Timeout => "timed out during the first phase".to_string(),
        Event::IoError(err) => format!("unreachable during the first phase: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op() -> TpcOperation {
        TpcOperation::new("1", &Message::put_request("k", "v"))
    }

    #[test]
    fn prepare_carries_the_request_and_id() {
        let op = op();
        let out = op.start();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message.msg_type, MessageType::PutRequest);
        assert_eq!(out[0].message.tpc_op_id.as_deref(), Some("1"));
    }

    #[test]
    fn one_vote_is_not_enough_to_decide() {
        let mut op = op();
        let out = op.on_event(Replica::Primary, Event::Reply(Message::ready("1")));
        assert!(out.is_empty());
        assert!(op.decision().is_none());
    }

    #[test]
    fn ready_for_another_transaction_counts_as_no() {
        let mut op = op();
        op.on_event(Replica::Primary, Event::Reply(Message::ready("99")));
        op.on_event(Replica::Secondary, Event::Reply(Message::ready("1")));
        assert_eq!(op.decision(), Some(Decision::Abort));
    }

    #[test]
    fn duplicate_ack_is_ignored() {
        let mut op = op();
        op.on_event(Replica::Primary, Event::Reply(Message::ready("1")));
        op.on_event(Replica::Secondary, Event::Reply(Message::ready("1")));
        op.on_event(Replica::Primary, Event::Reply(Message::ack("1")));
        let out = op.on_event(Replica::Primary, Event::Timeout);
        assert!(out.is_empty());
        assert!(!op.is_done());
    }
}
