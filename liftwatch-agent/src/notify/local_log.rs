use super::{Sink, SinkError};
use crate::config::SinkKind;
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Append-only text file, one `<timestamp> - <message>` line per entry
#[derive(Debug, Clone)]
pub struct LocalLog {
    path: PathBuf,
}

impl LocalLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the file on first use; never truncates
    pub async fn append(&self, message: &str) -> std::io::Result<()> {
        let line = format!("{} - {}\n", ctime_timestamp(&Local::now()), message);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

/// `Mon Jan  1 09:05:00 2024` style timestamp
pub fn ctime_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format("%a %b %e %H:%M:%S %Y").to_string()
}

pub struct LocalLogSink {
    log: LocalLog,
}

impl LocalLogSink {
    pub fn new(log: LocalLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Sink for LocalLogSink {
    fn kind(&self) -> SinkKind {
        SinkKind::LocalLog
    }

    async fn deliver(&self, message: &str) -> Result<(), SinkError> {
        self.log.append(message).await?;
        Ok(())
    }
}
