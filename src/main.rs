//! mailroom: a lightweight SMTP server
//!
//! Features:
//! - Connection lifecycle core with deterministic start/stop semantics
//! - Graceful or forced shutdown of in-flight sessions
//! - Pluggable verb handlers routed through a per-run verb map
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod protocol;
mod registry;
mod server;
mod verbs;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        listen = %config.listen,
        hostname = %config.hostname,
        shutdown_timeout = config.shutdown_timeout,
        "Starting mailroom server"
    );

    let server = Server::new(config);

    // Log running-state transitions for observability
    let mut state = server.subscribe();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let running = state.borrow_and_update().is_running();
            info!(running, "Server state changed");
        }
    });

    server.start().await?;
    if let Some(port) = server.port_number() {
        info!(port, "Server started");
    }

    tokio::signal::ctrl_c().await?;
    info!(active = server.active_connections(), "Shutdown signal received");

    server.stop().await?;
    Ok(())
}
