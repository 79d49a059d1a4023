//! Liftwatch - ski lift status watcher
//!
//! Polls the resort snow report, detects lift status changes and forwards
//! them to the configured sinks:
//! - Status source scraping the lift table (`status`)
//! - Change detection between snapshots (`changes`)
//! - Notification fan-out to social / email / local log (`notify`)
//! - Optional VPN rotation through an external tunnel client (`tunnel`)
//! - The jittered poll loop tying it together (`poll`)

pub mod changes;
pub mod config;
pub mod notify;
pub mod poll;
pub mod status;
pub mod tunnel;

use anyhow::{Context, Result};
use config::{AppConfig, SinkKind};
use notify::{LocalLog, Notifier};
use poll::{PollLoop, PollSettings};
use status::SnowReportSource;
use tunnel::TunnelManager;

/// Wire every component from the configuration
pub fn assemble(config: &AppConfig) -> Result<PollLoop<SnowReportSource>> {
    let local_log = config
        .sink_enabled(SinkKind::LocalLog)
        .then(|| LocalLog::new(&config.local_log_path));

    let source = SnowReportSource::new(config.status_url.clone(), local_log.clone())
        .context("Failed to build status source")?;
    let notifier = Notifier::from_config(config).context("Failed to build notification sinks")?;

    let mut poll = PollLoop::new(PollSettings::from_config(config), source, notifier);

    if let Some(tunnel) = &config.tunnel {
        let manager = TunnelManager::new(tunnel).context("Failed to build tunnel manager")?;
        poll = poll.with_tunnel(manager);
    }
    if let Some(log) = local_log {
        poll = poll.with_local_log(log);
    }

    Ok(poll)
}
