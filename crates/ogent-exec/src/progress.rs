//! Streaming progress frames from an executor to the agent core.
//!
//! Progress is a unidirectional stream of additive updates: output chunks,
//! an optional monotone percentage, and human-readable messages. The stream
//! never carries the terminal state — that is the `run` return value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Channel half handed to an executor for progress updates.
pub type ProgressSender = mpsc::Sender<ProgressUpdate>;

/// Status carried by a progress frame. Terminal states are never emitted
/// on the progress stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
}

/// A single incremental progress frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub status: ProgressStatus,
    /// Monotonically non-decreasing percentage, when the executor can
    /// estimate one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_chunk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_chunk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub ts: DateTime<Utc>,
}

impl ProgressUpdate {
    fn base() -> Self {
        Self {
            status: ProgressStatus::Running,
            progress: None,
            stdout_chunk: None,
            stderr_chunk: None,
            message: None,
            ts: Utc::now(),
        }
    }

    /// A chunk of standard output.
    pub fn stdout(chunk: impl Into<String>) -> Self {
        Self {
            stdout_chunk: Some(chunk.into()),
            ..Self::base()
        }
    }

    /// A chunk of standard error.
    pub fn stderr(chunk: impl Into<String>) -> Self {
        Self {
            stderr_chunk: Some(chunk.into()),
            ..Self::base()
        }
    }

    /// A human-readable status message with an optional percentage.
    pub fn message(message: impl Into<String>, progress: Option<u8>) -> Self {
        Self {
            message: Some(message.into()),
            progress,
            ..Self::base()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdout_frame_is_additive() {
        let update = ProgressUpdate::stdout("line\n");
        assert_eq!(update.status, ProgressStatus::Running);
        assert_eq!(update.stdout_chunk.as_deref(), Some("line\n"));
        assert!(update.stderr_chunk.is_none());
        assert!(update.message.is_none());
    }

    #[test]
    fn test_serialization_omits_empty_fields() {
        let update = ProgressUpdate::stderr("oops\n");
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("stderr_chunk"));
        assert!(!json.contains("stdout_chunk"));
        assert!(!json.contains("progress"));
    }
}
