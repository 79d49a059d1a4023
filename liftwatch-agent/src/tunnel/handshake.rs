//! Line-oriented handshake with the tunnel client
//!
//! The client reports progress on stdout. The first line carrying either
//! the success marker or the word "error" decides the outcome; end of
//! output before that means the process gave up.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

pub const SUCCESS_MARKER: &str = "Initialization Sequence Completed";
const ERROR_MARKER: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Established,
    /// Line that carried the error marker
    Failed(String),
    /// Output ended without either marker
    Exited,
}

/// Decide whether a single output line ends the handshake
pub fn classify_line(line: &str) -> Option<HandshakeOutcome> {
    if line.contains(SUCCESS_MARKER) {
        Some(HandshakeOutcome::Established)
    } else if line.to_ascii_lowercase().contains(ERROR_MARKER) {
        Some(HandshakeOutcome::Failed(line.to_string()))
    } else {
        None
    }
}

/// Read until the handshake is decided. Every line read is appended to
/// `transcript`, which stays valid if this future is dropped early.
pub async fn read_handshake<R>(
    reader: &mut R,
    transcript: &mut Vec<String>,
) -> std::io::Result<HandshakeOutcome>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        debug!("[vpn] {}", line);
        let outcome = classify_line(&line);
        transcript.push(line);
        if let Some(outcome) = outcome {
            return Ok(outcome);
        }
    }
    Ok(HandshakeOutcome::Exited)
}
