//! # config
//!
//! why: one place for addresses, timeouts, pool sizes and capacities
//! relations: filled from clap flags in the bins; read by coordinator.rs and participant.rs
//! what: CoordinatorConfig, ParticipantConfig and their defaults

use std::path::PathBuf;
use std::time::Duration;

/// Bound on every network exchange unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Where clients send get/put/del requests.
    pub client_addr: String,
    /// Where participants announce themselves.
    pub registration_addr: String,
    /// Per-exchange response timeout for both phases.
    pub timeout: Duration,
    pub client_workers: usize,
    /// One worker processes registrations strictly in arrival order.
    pub registration_workers: usize,
    pub cache_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            client_addr: "127.0.0.1:8080".to_string(),
            registration_addr: "127.0.0.1:9090".to_string(),
            timeout: DEFAULT_TIMEOUT,
            client_workers: 8,
            registration_workers: 1,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    /// Position on the ring.
    pub id: u64,
    pub listen_addr: String,
    /// Registration address of the coordinator; `None` for statically configured clusters.
    pub master_registration_addr: Option<String>,
    /// Directory holding `<id>@<host>.log.json`.
    pub log_dir: PathBuf,
    pub workers: usize,
    pub cache_capacity: usize,
    /// Idle bound on a coordinator connection, and on each registration attempt.
    pub timeout: Duration,
    /// How many times registration is tried before giving up.
    pub registration_attempts: usize,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            id: 0,
            listen_addr: "127.0.0.1:0".to_string(),
            master_registration_addr: None,
            log_dir: PathBuf::from("tpc_logs"),
            workers: 8,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            timeout: DEFAULT_TIMEOUT,
            registration_attempts: 10,
        }
    }
}
