//! # tpc-node
//!
//! why: run the coordinator and participants as real processes talking over TCP
//! relations: drives the tpc-core state machines, persists through tpc-storage
//! what: worker pool, socket server, wire framing, participant and coordinator servers, client

pub mod client;
pub mod config;
pub mod coordinator;
pub mod participant;
pub mod pool;
pub mod server;
pub mod telemetry;
pub mod wire;

pub use client::KvClient;
pub use config::{CoordinatorConfig, ParticipantConfig};
pub use coordinator::{ClientHandler, MasterServer, RegistrationHandler, TpcMaster};
pub use participant::{register_with_master, Participant, ParticipantHandler, ParticipantServer};
pub use pool::{PoolError, WorkerPool};
pub use server::{NetworkHandler, SocketServer};
pub use wire::Connection;
