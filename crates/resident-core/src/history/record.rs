//! History record types

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendKind;
use crate::error::{Error, ErrorKind};

/// Terminal outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Failed,
    /// Admitted, then refused before it ran (backend paused, failed or shut down)
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for RecordedError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Stored artifact, relative to the history root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// One committed line of a date's log. Never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub seq: u64,
    pub date: String,
    pub backend: BackendKind,
    pub request_id: Uuid,
    pub timestamp: DateTime<Local>,
    pub input_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    pub duration_ms: f64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordedError>,
}

/// Everything about a terminal request except its position in the log.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub backend: BackendKind,
    pub request_id: Uuid,
    pub timestamp: DateTime<Local>,
    pub input_summary: String,
    pub output_summary: Option<String>,
    pub duration_ms: f64,
    pub outcome: Outcome,
    pub error: Option<RecordedError>,
}

impl RecordDraft {
    pub fn completed(
        backend: BackendKind,
        request_id: Uuid,
        input_summary: String,
        output_summary: String,
        duration_ms: f64,
    ) -> Self {
        Self {
            backend,
            request_id,
            timestamp: Local::now(),
            input_summary,
            output_summary: Some(output_summary),
            duration_ms: round_ms(duration_ms),
            outcome: Outcome::Completed,
            error: None,
        }
    }

    pub fn failed(
        backend: BackendKind,
        request_id: Uuid,
        input_summary: String,
        duration_ms: f64,
        error: &Error,
    ) -> Self {
        let outcome = match error {
            Error::BackendUnavailable { .. } | Error::BackendBusy { .. } => Outcome::Rejected,
            _ => Outcome::Failed,
        };
        Self {
            backend,
            request_id,
            timestamp: Local::now(),
            input_summary,
            output_summary: None,
            duration_ms: round_ms(duration_ms),
            outcome,
            error: Some(RecordedError::from(error)),
        }
    }

    /// Calendar date (server-local) this record belongs to.
    pub fn date(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }
}

/// Where a committed record landed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRef {
    pub date: String,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

fn round_ms(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}
