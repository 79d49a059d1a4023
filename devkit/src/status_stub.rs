/*!
Scripted status source

Replays a fixed sequence of snapshots and failures, one per `fetch()`.
Once the script is exhausted every fetch fails, which makes runaway loops
visible in tests instead of silently polling the same snapshot forever.
*/

use async_trait::async_trait;
use liftwatch::status::{SourceError, StatusMap, StatusSource};
use std::collections::VecDeque;

/// Build a snapshot from `(name, status)` pairs, keeping their order
pub fn snapshot(entries: &[(&str, &str)]) -> StatusMap {
    entries.iter().copied().collect()
}

#[derive(Debug)]
enum Step {
    Snapshot(StatusMap),
    Failure(String),
}

#[derive(Debug, Default)]
pub struct ScriptedStatusSource {
    script: VecDeque<Step>,
    fetches: usize,
}

impl ScriptedStatusSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful fetch
    pub fn then_snapshot(mut self, entries: &[(&str, &str)]) -> Self {
        self.script.push_back(Step::Snapshot(snapshot(entries)));
        self
    }

    /// Queue a fetch failing with `SourceError::Unavailable`
    pub fn then_failure(mut self, reason: &str) -> Self {
        self.script.push_back(Step::Failure(reason.to_string()));
        self
    }

    /// Number of `fetch()` calls so far
    pub fn fetches(&self) -> usize {
        self.fetches
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

#[async_trait]
impl StatusSource for ScriptedStatusSource {
    async fn fetch(&mut self) -> Result<StatusMap, SourceError> {
        self.fetches += 1;
        match self.script.pop_front() {
            Some(Step::Snapshot(statuses)) => Ok(statuses),
            Some(Step::Failure(reason)) => Err(SourceError::Unavailable(reason)),
            None => Err(SourceError::Unavailable("script exhausted".to_string())),
        }
    }
}
