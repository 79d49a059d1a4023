//! Lift status snapshots and the sources that produce them
//!
//! - [`StatusMap`]: ordered lift name → status snapshot for one poll
//! - [`StatusSource`]: anything able to produce a fresh snapshot
//! - rendering helpers for the human readable status table

mod snow_report;

pub use snow_report::{parse_status_page, SnowReportSource, USER_AGENTS};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("status page request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status page answered {status}")]
    Status { status: reqwest::StatusCode },
    #[error("status source unavailable: {0}")]
    Unavailable(String),
}

/// Produces the current status of every tracked lift
#[async_trait]
pub trait StatusSource: Send {
    async fn fetch(&mut self) -> Result<StatusMap, SourceError>;
}

/// Lift name → status, iterated in the order the lifts were inserted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusMap {
    entries: Vec<(String, String)>,
}

impl StatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a replaced lift keeps its original position
    pub fn insert(&mut self, name: impl Into<String>, status: impl Into<String>) {
        let name = name.into();
        let status = status.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = status,
            None => self.entries.push((name, status)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, s)| (n.as_str(), s.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N, S> FromIterator<(N, S)> for StatusMap
where
    N: Into<String>,
    S: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, S)>>(iter: I) -> Self {
        let mut map = StatusMap::new();
        for (name, status) in iter {
            map.insert(name, status);
        }
        map
    }
}

const TABLE_HEADER: &str = "Current lift statuses:";

/// Multi-line table used for the console log and the local log file
pub fn render_statuses(statuses: &StatusMap) -> String {
    let mut out = format!("{TABLE_HEADER}\n");
    for (name, status) in statuses.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(status);
        out.push('\n');
    }
    out
}

/// Inverse of [`render_statuses`]; `None` if the header is missing
pub fn parse_rendered(text: &str) -> Option<StatusMap> {
    let mut lines = text.lines();
    if lines.next()? != TABLE_HEADER {
        return None;
    }
    Some(
        lines
            .filter_map(|line| line.split_once(": "))
            .collect(),
    )
}
