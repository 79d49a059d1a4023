//! Notification fan-out
//!
//! Every enabled sink gets the message, one after the other. A failing sink
//! is recorded in the [`DispatchReport`] and never stops the remaining ones.

mod email;
mod local_log;
mod social;

pub use email::EmailSink;
pub use local_log::{ctime_timestamp, LocalLog, LocalLogSink};
pub use social::{oauth1_authorization, percent_encode, OAuthCredentials, SocialSink};

use crate::config::{AppConfig, SinkKind};
use async_trait::async_trait;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink misconfigured: {0}")]
    Config(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote rejected the post ({status}): {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// A delivery channel for change notifications
#[async_trait]
pub trait Sink: Send + Sync {
    fn kind(&self) -> SinkKind;

    async fn deliver(&self, message: &str) -> Result<(), SinkError>;
}

/// Result of one sink delivery attempt
#[derive(Debug)]
pub struct SinkOutcome {
    pub sink: SinkKind,
    pub result: Result<(), SinkError>,
}

/// Outcomes of every sink attempted for one message
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<SinkOutcome>,
}

impl DispatchReport {
    pub fn failures(&self) -> impl Iterator<Item = (SinkKind, &SinkError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.sink, e)))
    }

    pub fn failed_sinks(&self) -> Vec<SinkKind> {
        self.failures().map(|(sink, _)| sink).collect()
    }

    pub fn delivered(&self) -> Vec<SinkKind> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.sink)
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

pub struct Notifier {
    sinks: Vec<Box<dyn Sink>>,
}

impl Notifier {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self { sinks }
    }

    /// Build the sinks enabled in the configuration
    pub fn from_config(config: &AppConfig) -> Result<Self, SinkError> {
        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();

        for kind in &config.sinks {
            match kind {
                SinkKind::Social => {
                    let social = config
                        .social
                        .as_ref()
                        .ok_or_else(|| SinkError::Config("social credentials missing".into()))?;
                    sinks.push(Box::new(SocialSink::new(social)?));
                }
                SinkKind::Email => {
                    let email = config
                        .email
                        .as_ref()
                        .ok_or_else(|| SinkError::Config("email settings missing".into()))?;
                    sinks.push(Box::new(EmailSink::new(email)?));
                }
                SinkKind::LocalLog => {
                    sinks.push(Box::new(LocalLogSink::new(LocalLog::new(&config.local_log_path))));
                }
            }
        }

        info!(
            "Notifier ready with sinks: [{}]",
            sinks.iter().map(|s| s.kind().as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(Self { sinks })
    }

    /// Attempt every sink; failures are collected, never short-circuited
    pub async fn notify(&self, message: &str) -> DispatchReport {
        let mut report = DispatchReport::default();

        for sink in &self.sinks {
            let result = sink.deliver(message).await;
            match &result {
                Ok(()) => debug!("Delivered notification via {}", sink.kind()),
                Err(e) => error!("Notification via {} failed: {}", sink.kind(), e),
            }
            report.outcomes.push(SinkOutcome {
                sink: sink.kind(),
                result,
            });
        }

        report
    }
}
