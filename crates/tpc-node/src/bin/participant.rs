//! Participant process; see `tpc-master --help` for a full cluster example.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use tpc_node::{telemetry, ParticipantConfig, ParticipantServer};

#[derive(Parser, Debug)]
#[command(name = "tpc-participant")]
#[command(about = "Run one replica of the two-phase commit key-value store")]
struct Args {
    /// Ring position of this participant
    #[arg(long)]
    id: u64,

    /// Address the coordinator reaches this participant on
    #[arg(long, default_value = "127.0.0.1:0")]
    listen_addr: String,

    /// Coordinator registration address; omit for a statically configured cluster
    #[arg(long = "master")]
    master_registration_addr: Option<String>,

    /// Directory for the write-ahead log
    #[arg(long, default_value = "tpc_logs")]
    log_dir: PathBuf,

    /// Threads serving coordinator connections
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Entries kept in the local read cache
    #[arg(long, default_value_t = 1000)]
    cache_capacity: usize,

    /// Idle timeout for coordinator connections, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    telemetry::init("info");
    let args = Args::parse();

    let config = ParticipantConfig {
        id: args.id,
        listen_addr: args.listen_addr,
        master_registration_addr: args.master_registration_addr,
        log_dir: args.log_dir,
        workers: args.workers,
        cache_capacity: args.cache_capacity,
        timeout: Duration::from_millis(args.timeout_ms),
        ..ParticipantConfig::default()
    };
    let server = ParticipantServer::start(config)?;
    info!(participant = %server.info(), "participant running");

    loop {
        thread::park();
    }
}
