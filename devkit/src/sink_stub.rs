/*!
Mock notification sinks

`MockSink` records every message it is handed and can be told to fail,
so tests can check fan-out behaviour without SMTP or HTTP.
*/

use async_trait::async_trait;
use liftwatch::config::SinkKind;
use liftwatch::notify::{Sink, SinkError};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub sink: SinkKind,
    pub message: String,
    pub delivered: bool,
}

/// Sink stub sharing its record through cheap clones
#[derive(Clone)]
pub struct MockSink {
    kind: SinkKind,
    failure: Option<String>,
    sent: Arc<Mutex<Vec<SentNotification>>>,
}

impl MockSink {
    pub fn new(kind: SinkKind) -> Self {
        Self {
            kind,
            failure: None,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A sink whose every delivery fails with `reason`
    pub fn failing(kind: SinkKind, reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::new(kind)
        }
    }

    /// Every attempt, successful or not
    pub fn attempts(&self) -> Vec<SentNotification> {
        self.sent.lock().clone()
    }

    /// Messages that were delivered
    pub fn delivered(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.delivered)
            .map(|n| n.message.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Sink for MockSink {
    fn kind(&self) -> SinkKind {
        self.kind
    }

    async fn deliver(&self, message: &str) -> Result<(), SinkError> {
        self.sent.lock().push(SentNotification {
            sink: self.kind,
            message: message.to_string(),
            delivered: self.failure.is_none(),
        });
        tracing::info!("[mock {}] {}", self.kind, message);

        match &self.failure {
            Some(reason) => Err(SinkError::Other(reason.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_the_record() {
        let sink = MockSink::new(SinkKind::Email);
        let handle = sink.clone();

        sink.deliver("first").await.unwrap();
        assert_eq!(handle.delivered(), vec!["first"]);

        handle.clear();
        assert!(sink.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_failing_sink_records_attempt() {
        let sink = MockSink::failing(SinkKind::Social, "401 Unauthorized");

        let err = sink.deliver("hello").await.unwrap_err();
        assert_eq!(err.to_string(), "401 Unauthorized");
        assert!(sink.delivered().is_empty());
        assert_eq!(sink.attempts().len(), 1);
        assert!(!sink.attempts()[0].delivered);
    }
}
