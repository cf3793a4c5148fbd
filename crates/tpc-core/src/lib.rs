//! # tpc-core
//!
//! why: keep the two-phase commit protocol pure and portable, free of sockets and files
//! relations: used by tpc-storage for log replay, tpc-node for the networked runtime
//! what: wire messages, replica placement, log entries, participant and coordinator state machines

pub mod coordinator;
pub mod error;
pub mod log;
pub mod message;
pub mod participant;
pub mod ring;

pub use coordinator::{Decision, Event, Outgoing, Replica, TpcOperation, TpcPhase};
pub use error::{KvError, Result};
pub use log::{replay, LogEntry, Mutation, Phase, Replay};
pub use message::{Message, MessageType, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use participant::{Checkpoint, ParticipantState, Step, TxnState};
pub use ring::{hash_to_u64, ParticipantInfo, Registration, ReplicaRing};
