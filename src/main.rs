//! time-reactor: a single-threaded TCP time server
//!
//! Features:
//! - Readiness-driven event loop serving many clients on one thread
//! - Per-read or newline-delimited request framing
//! - Configurable time format and optional greeting
//! - Configuration via CLI arguments or TOML file

use time_reactor::{Config, Reactor};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        framing = ?config.framing,
        poll_timeout_ms = config.poll_timeout.as_millis() as u64,
        "Starting time server"
    );

    let reactor = Reactor::start(&config)?;
    reactor.run()?;
    Ok(())
}
