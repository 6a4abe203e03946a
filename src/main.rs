//! tunnelgate - reverse tunnel relay
//!
//! Agents behind NAT dial the control port; users dial the data port and are
//! relayed to the connected agent.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Cli, Settings};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnelgate_relay::RelayServer;

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(&cli)?;

    setup_logging(&settings.log_level)?;

    info!("tunnelgate {} starting", env!("GIT_TAG"));
    info!("Agent (control) port: {}", settings.relay.control_port);
    info!("User (data) port: {}", settings.relay.data_port);

    let server = RelayServer::bind(settings.relay)
        .await
        .context("Failed to start relay")?;

    let result = server
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        })
        .await;

    if let Err(e) = result {
        error!("Relay stopped: {}", e);
        return Err(e).context("Relay failed");
    }

    info!("Relay stopped");
    Ok(())
}
