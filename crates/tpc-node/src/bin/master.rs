//! Coordinator process.
//!
//! ```bash
//! tpc-master --client-addr 127.0.0.1:8080 --registration-addr 127.0.0.1:9090
//! tpc-participant --id 10 --listen-addr 127.0.0.1:7010 --master 127.0.0.1:9090
//! tpc-participant --id 20 --listen-addr 127.0.0.1:7020 --master 127.0.0.1:9090
//! ```

use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use tpc_node::{telemetry, CoordinatorConfig, MasterServer};

#[derive(Parser, Debug)]
#[command(name = "tpc-master")]
#[command(about = "Run the two-phase commit coordinator")]
struct Args {
    /// Address clients connect to
    #[arg(long, default_value = "127.0.0.1:8080")]
    client_addr: String,

    /// Address participants register on
    #[arg(long, default_value = "127.0.0.1:9090")]
    registration_addr: String,

    /// Response timeout for each participant exchange, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Threads serving client connections
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Entries kept in the coordinator's write cache
    #[arg(long, default_value_t = 1000)]
    cache_capacity: usize,

    /// Participant known up front, as <id>@<host>:<port> (repeatable)
    #[arg(long = "member")]
    members: Vec<String>,
}

fn main() -> Result<()> {
    telemetry::init("info");
    let args = Args::parse();

    let config = CoordinatorConfig {
        client_addr: args.client_addr,
        registration_addr: args.registration_addr,
        timeout: Duration::from_millis(args.timeout_ms),
        client_workers: args.workers,
        cache_capacity: args.cache_capacity,
        ..CoordinatorConfig::default()
    };
    let server = MasterServer::start(config, &args.members)?;
    info!(
        clients = %server.client_addr(),
        registrations = %server.registration_addr(),
        members = server.master().participants().len(),
        "coordinator running"
    );

    loop {
        thread::park();
    }
}
