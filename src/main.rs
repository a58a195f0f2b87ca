//! edge-reactor: a single-threaded edge-triggered TCP echo server.
//!
//! One event loop, one poll instance, one owning connection registry. The
//! reactor core in [`reactor`] is protocol-agnostic; this binary plugs in the
//! [`echo::EchoConn`] contract implementation.
//!
//! Features:
//! - Non-blocking accept/read/write with edge-triggered readiness
//! - Per-connection idle timeout enforced by a once-per-second sweep
//! - Configuration via CLI arguments or TOML file

mod config;
mod echo;
mod reactor;

use config::Config;
use echo::EchoConn;
use reactor::Reactor;
use std::time::Duration;
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
        timeout_secs = config.timeout_secs,
        max_connections = config.max_connections,
        "Starting edge-reactor echo server"
    );

    let mut reactor = Reactor::<EchoConn>::new(
        &config.host,
        config.port,
        Duration::from_secs(config.timeout_secs),
        config.max_connections,
    )?;

    info!(addr = %reactor.local_addr()?, "Listening");

    reactor.run()?;
    Ok(())
}
