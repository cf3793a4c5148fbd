//! # telemetry
//!
//! why: structured log output for the binaries and, opt-in, for tests
//! relations: called once at start-up by every bin; the library only emits tracing events
//! what: init, a fmt subscriber filtered by RUST_LOG

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to `default_filter`.
///
/// Safe to call more than once; only the first call takes effect.
pub fn init(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .try_init();
}
