//! Liftwatch agent entry point
//!
//! Loads configuration, wires the components and runs the poll loop until
//! it gives up or the process receives Ctrl-C.

use anyhow::{Context, Result};
use liftwatch::config::AppConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("liftwatch=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Liftwatch agent v{} starting", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!(
        "Polling {} every {}s (±20%), sinks: [{}], VPN rotation: {}",
        config.status_url,
        config.poll_interval.as_secs(),
        config.sinks.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
        if config.tunnel.is_some() { "on" } else { "off" }
    );

    let mut poll = liftwatch::assemble(&config)?;

    let outcome = tokio::select! {
        result = poll.run() => result.context("Poll loop stopped"),
        signal = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            signal.context("Failed to listen for Ctrl-C")
        }
    };

    poll.shutdown().await;
    outcome
}
