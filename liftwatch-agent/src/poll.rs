//! Poll loop
//!
//! Owns the last known lift statuses and the active tunnel session. Each
//! iteration sleeps a jittered interval, rotates the tunnel when due,
//! fetches, diffs and notifies. Iterations return a classified result and
//! the loop decides whether to back off and continue or to stop. Status
//! page outages only back off; the failure budget is spent by tunnel
//! failures alone.

use crate::changes::{compose_message, diff, ChangeEntry};
use crate::config::{AppConfig, SinkFailurePolicy, SinkKind};
use crate::notify::{DispatchReport, LocalLog, Notifier};
use crate::status::{render_statuses, SourceError, StatusMap, StatusSource};
use crate::tunnel::{TunnelError, TunnelManager, TunnelSession};
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_JITTER_RATIO: f64 = 0.2;
const MAX_BACKOFF_FACTOR: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("status fetch failed: {0}")]
    Source(#[from] SourceError),
    #[error("tunnel failure: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("notification delivery failed via {}", join_sinks(.sinks))]
    Delivery { sinks: Vec<SinkKind> },
    #[error("giving up after {failures} consecutive failures, last one: {last}")]
    TooManyFailures { failures: u32, last: Box<PollError> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth another attempt on the next cycle
    Recoverable,
    /// Ends the loop
    Fatal,
}

impl PollError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Source(_) => FailureClass::Recoverable,
            Self::Tunnel(e) if e.is_recoverable() => FailureClass::Recoverable,
            Self::Tunnel(_) | Self::Delivery { .. } | Self::TooManyFailures { .. } => {
                FailureClass::Fatal
            }
        }
    }
}

fn join_sinks(sinks: &[SinkKind]) -> String {
    sinks.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub base_interval: Duration,
    /// Fraction of `base_interval` the sleep may deviate by, in both directions
    pub jitter_ratio: f64,
    pub sink_failure_policy: SinkFailurePolicy,
    pub max_consecutive_failures: u32,
}

impl PollSettings {
    pub fn new(base_interval: Duration) -> Self {
        Self {
            base_interval,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            sink_failure_policy: SinkFailurePolicy::Continue,
            max_consecutive_failures: 5,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_interval: config.poll_interval,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            sink_failure_policy: config.sink_failure_policy,
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

/// What one poll cycle observed and did
#[derive(Debug)]
pub struct IterationReport {
    pub lift_count: usize,
    pub changes: Vec<ChangeEntry>,
    pub message: Option<String>,
    pub dispatch: Option<DispatchReport>,
    pub rotated: bool,
}

/// `base` moved by a uniform offset within `±ratio * base`
pub fn jittered_interval<R: Rng + ?Sized>(base: Duration, ratio: f64, rng: &mut R) -> Duration {
    let base_secs = base.as_secs_f64();
    let spread = base_secs * ratio.clamp(0.0, 1.0);
    if spread <= 0.0 {
        return base;
    }
    let offset = rng.gen_range(-spread..=spread);
    Duration::try_from_secs_f64((base_secs + offset).max(0.0)).unwrap_or(base)
}

/// Extra wait after the `attempt`-th consecutive failure: doubling, capped at 10x base
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = 2u32.saturating_pow(exponent).min(MAX_BACKOFF_FACTOR);
    base.saturating_mul(factor)
}

pub struct PollLoop<S> {
    settings: PollSettings,
    source: S,
    notifier: Notifier,
    tunnel: Option<TunnelManager>,
    session: Option<TunnelSession>,
    local_log: Option<LocalLog>,
    last_statuses: StatusMap,
    next_rotation: Option<Instant>,
    consecutive_failures: u32,
    source_outages: u32,
}

impl<S: StatusSource> PollLoop<S> {
    pub fn new(settings: PollSettings, source: S, notifier: Notifier) -> Self {
        Self {
            settings,
            source,
            notifier,
            tunnel: None,
            session: None,
            local_log: None,
            last_statuses: StatusMap::new(),
            next_rotation: None,
            consecutive_failures: 0,
            source_outages: 0,
        }
    }

    pub fn with_tunnel(mut self, tunnel: TunnelManager) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Also persist every fetched status table to `log`
    pub fn with_local_log(mut self, log: LocalLog) -> Self {
        self.local_log = Some(log);
        self
    }

    pub fn last_statuses(&self) -> &StatusMap {
        &self.last_statuses
    }

    pub fn tunnel_session(&self) -> Option<&TunnelSession> {
        self.session.as_ref()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Failures counted against `max_consecutive_failures`
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Status fetches failed in a row; never ends the loop
    pub fn source_outages(&self) -> u32 {
        self.source_outages
    }

    pub fn next_rotation(&self) -> Option<Instant> {
        self.next_rotation
    }

    /// Connect the tunnel (if enabled) and take the initial snapshot
    pub async fn bootstrap(&mut self) -> Result<(), PollError> {
        if let Some(tunnel) = &self.tunnel {
            if self.session.is_none() {
                self.session = Some(tunnel.connect_random().await?);
                sleep(tunnel.settle_delay()).await;
            }
        }

        let initial = self.source.fetch().await?;
        info!("{}", render_statuses(&initial));
        self.last_statuses = initial;

        if let Some(tunnel) = &self.tunnel {
            self.next_rotation = Some(Instant::now() + tunnel.rotation_interval());
        }
        Ok(())
    }

    /// Bootstrap, then poll until a fatal failure
    pub async fn run(&mut self) -> Result<(), PollError> {
        while let Err(e) = self.bootstrap().await {
            self.recover(e).await?;
        }
        self.reset_failures();

        loop {
            match self.run_iteration().await {
                Ok(report) => {
                    self.reset_failures();
                    debug!(
                        "Poll complete: {} lifts, {} changes{}",
                        report.lift_count,
                        report.changes.len(),
                        if report.rotated { ", tunnel rotated" } else { "" }
                    );
                }
                Err(e) => self.recover(e).await?,
            }
        }
    }

    /// One full cycle: jittered sleep, then [`PollLoop::poll_once`]
    pub async fn run_iteration(&mut self) -> Result<IterationReport, PollError> {
        let wait = jittered_interval(
            self.settings.base_interval,
            self.settings.jitter_ratio,
            &mut rand::thread_rng(),
        );
        debug!("Next poll in {:.1}s", wait.as_secs_f64());
        sleep(wait).await;

        self.poll_once().await
    }

    /// Rotate when due, fetch, diff against the last snapshot and notify
    pub async fn poll_once(&mut self) -> Result<IterationReport, PollError> {
        let rotated = self.rotate_if_due().await?;

        let current = self.source.fetch().await?;
        let rendered = render_statuses(&current);
        info!("{}", rendered);
        if let Some(log) = &self.local_log {
            if let Err(e) = log.append(&rendered).await {
                warn!("Failed to persist status table to {}: {}", log.path().display(), e);
            }
        }

        let changes = diff(&current, &self.last_statuses);
        let message = compose_message(&changes);
        let dispatch = match &message {
            Some(message) => {
                let report = self.notifier.notify(message).await;
                if report.is_clean() {
                    info!("Notification sent: {}", message);
                } else {
                    warn!(
                        "Notification sent with failures ({}): {}",
                        join_sinks(&report.failed_sinks()),
                        message
                    );
                }
                Some(report)
            }
            None => None,
        };

        let lift_count = current.len();
        self.last_statuses = current;

        if let Some(report) = &dispatch {
            if !report.is_clean() && self.settings.sink_failure_policy == SinkFailurePolicy::Abort {
                return Err(PollError::Delivery {
                    sinks: report.failed_sinks(),
                });
            }
        }

        Ok(IterationReport {
            lift_count,
            changes,
            message,
            dispatch,
            rotated,
        })
    }

    /// Terminate the active tunnel session, if any
    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.terminate().await;
        }
    }

    async fn rotate_if_due(&mut self) -> Result<bool, PollError> {
        let Some(tunnel) = &self.tunnel else {
            return Ok(false);
        };

        let due = self.next_rotation.map_or(true, |at| Instant::now() >= at);
        if !due && self.session.is_some() {
            return Ok(false);
        }

        let session = match self.session.take() {
            Some(current) => tunnel.rotate(current).await?,
            None => {
                warn!("No active tunnel session, reconnecting");
                tunnel.connect_random().await?
            }
        };
        self.session = Some(session);
        sleep(tunnel.settle_delay()).await;
        self.next_rotation = Some(Instant::now() + tunnel.rotation_interval());
        Ok(true)
    }

    fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
        self.source_outages = 0;
    }

    async fn recover(&mut self, error: PollError) -> Result<(), PollError> {
        if error.class() == FailureClass::Fatal {
            error!("Fatal poll failure: {}", error);
            return Err(error);
        }

        let attempt = if let PollError::Source(_) = &error {
            self.source_outages += 1;
            warn!("Status page unavailable ({} in a row): {}", self.source_outages, error);
            self.source_outages
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.settings.max_consecutive_failures {
                error!("Poll failed {} times in a row: {}", self.consecutive_failures, error);
                return Err(PollError::TooManyFailures {
                    failures: self.consecutive_failures,
                    last: Box::new(error),
                });
            }
            warn!(
                "Poll failed ({}/{}): {}",
                self.consecutive_failures, self.settings.max_consecutive_failures, error
            );
            self.consecutive_failures
        };

        let delay = backoff_delay(self.settings.base_interval, attempt);
        debug!("Backing off {:?}", delay);
        sleep(delay).await;
        Ok(())
    }
}
