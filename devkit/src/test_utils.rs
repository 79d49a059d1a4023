/*!
Test harness for the poll loop

Wires a `ScriptedStatusSource` and any number of `MockSink`s into a real
`PollLoop`, then lets a test run cycles and assert on what was notified.
Meant to run under a paused tokio clock so the jittered sleeps are free.
*/

use crate::sink_stub::MockSink;
use crate::status_stub::ScriptedStatusSource;
use anyhow::Result;
use liftwatch::config::{SinkFailurePolicy, SinkKind};
use liftwatch::notify::{LocalLog, LocalLogSink, Notifier, Sink};
use liftwatch::poll::{IterationReport, PollError, PollLoop, PollSettings};
use liftwatch::status::StatusMap;
use std::path::Path;
use std::time::Duration;

/// Complete harness around one poll loop
pub struct TestHarness {
    pub poll: PollLoop<ScriptedStatusSource>,
    sinks: Vec<MockSink>,
    expectations: Vec<Expectation>,
    bootstrapped: bool,
}

#[derive(Debug)]
struct Expectation {
    sink: SinkKind,
    expected_count: usize,
}

pub struct HarnessBuilder {
    settings: PollSettings,
    source: ScriptedStatusSource,
    mocks: Vec<MockSink>,
    extra_sinks: Vec<Box<dyn Sink>>,
    local_log: Option<LocalLog>,
}

impl TestHarness {
    /// Start building a harness polling every `base_interval`
    pub fn builder(base_interval: Duration) -> HarnessBuilder {
        init_tracing();
        HarnessBuilder {
            settings: PollSettings::new(base_interval),
            source: ScriptedStatusSource::new(),
            mocks: Vec::new(),
            extra_sinks: Vec::new(),
            local_log: None,
        }
    }

    pub fn sink(&self, kind: SinkKind) -> Option<&MockSink> {
        self.sinks.iter().find(|s| Sink::kind(*s) == kind)
    }

    pub fn last_statuses(&self) -> &StatusMap {
        self.poll.last_statuses()
    }

    /// Runs the initial fetch once, before the first cycle
    pub async fn bootstrap(&mut self) -> Result<(), PollError> {
        if !self.bootstrapped {
            self.poll.bootstrap().await?;
            self.bootstrapped = true;
        }
        Ok(())
    }

    /// Bootstrap if needed, then run `cycles` iterations, collecting every outcome
    pub async fn run_cycles(
        &mut self,
        cycles: usize,
    ) -> Result<Vec<Result<IterationReport, PollError>>, PollError> {
        self.bootstrap().await?;

        let mut outcomes = Vec::with_capacity(cycles);
        for _ in 0..cycles {
            outcomes.push(self.poll.run_iteration().await);
        }
        Ok(outcomes)
    }

    /// Expect `count` delivery attempts on `sink` by the time of verification
    pub fn expect_notifications(&mut self, sink: SinkKind, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            sink,
            expected_count: count,
        });
        self
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let Some(sink) = self.sink(expectation.sink) else {
                anyhow::bail!("No mock sink registered for {}", expectation.sink);
            };

            let actual = sink.attempts().len();
            if actual != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for {}: expected {} notifications, got {}",
                    expectation.sink,
                    expectation.expected_count,
                    actual
                );
            }
            tracing::info!("{}: {} notifications as expected", expectation.sink, actual);
        }
        Ok(())
    }
}

impl HarnessBuilder {
    pub fn snapshot(mut self, entries: &[(&str, &str)]) -> Self {
        self.source = self.source.then_snapshot(entries);
        self
    }

    pub fn fetch_failure(mut self, reason: &str) -> Self {
        self.source = self.source.then_failure(reason);
        self
    }

    pub fn recording_sink(mut self, kind: SinkKind) -> Self {
        self.mocks.push(MockSink::new(kind));
        self
    }

    pub fn failing_sink(mut self, kind: SinkKind, reason: &str) -> Self {
        self.mocks.push(MockSink::failing(kind, reason));
        self
    }

    /// Real local log sink writing to `path`; status tables are persisted there too
    pub fn local_log(mut self, path: impl AsRef<Path>) -> Self {
        let log = LocalLog::new(path);
        self.extra_sinks.push(Box::new(LocalLogSink::new(log.clone())));
        self.local_log = Some(log);
        self
    }

    pub fn failure_policy(mut self, policy: SinkFailurePolicy) -> Self {
        self.settings.sink_failure_policy = policy;
        self
    }

    pub fn max_consecutive_failures(mut self, failures: u32) -> Self {
        self.settings.max_consecutive_failures = failures;
        self
    }

    pub fn build(self) -> TestHarness {
        let mut sinks: Vec<Box<dyn Sink>> = self
            .mocks
            .iter()
            .cloned()
            .map(|mock| Box::new(mock) as Box<dyn Sink>)
            .collect();
        sinks.extend(self.extra_sinks);
        sinks.sort_by_key(|s| s.kind());

        let mut poll = PollLoop::new(self.settings, self.source, Notifier::new(sinks));
        if let Some(log) = self.local_log {
            poll = poll.with_local_log(log);
        }

        TestHarness {
            poll,
            sinks: self.mocks,
            expectations: Vec::new(),
            bootstrapped: false,
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("liftwatch=debug")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_harness_basic_functionality() {
        let mut harness = TestHarness::builder(Duration::from_secs(60))
            .snapshot(&[("A", "Open")])
            .snapshot(&[("A", "Open")])
            .recording_sink(SinkKind::Email)
            .build();
        harness.expect_notifications(SinkKind::Email, 0);

        let outcomes = harness.run_cycles(1).await.unwrap();

        assert!(outcomes[0].as_ref().unwrap().message.is_none());
        harness.verify_expectations().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmet_expectation_is_reported() {
        let mut harness = TestHarness::builder(Duration::from_secs(60))
            .snapshot(&[("A", "Open")])
            .recording_sink(SinkKind::Social)
            .build();
        harness.expect_notifications(SinkKind::Social, 1);
        harness.bootstrap().await.unwrap();

        assert!(harness.verify_expectations().is_err());
    }
}
