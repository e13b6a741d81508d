//! Request representation as it moves through admission and execution.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::backend::{BackendKind, BackendOutput, Payload};
use crate::error::{Error, Result};
use crate::history::StoredRef;

/// Server-generated request identifier.
pub type RequestId = Uuid;

/// Request lifecycle. `Completed`, `Rejected` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Running,
    Completed,
    Rejected,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Rejected | RequestStatus::Failed
        )
    }
}

/// An admitted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub backend: BackendKind,
    pub submitted_at: DateTime<Local>,
    pub payload: Payload,
    pub status: RequestStatus,
}

impl Request {
    pub fn new(backend: BackendKind, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            submitted_at: Local::now(),
            payload,
            status: RequestStatus::Queued,
        }
    }
}

/// Whether the terminal record of a request made it to disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HistoryStatus {
    Recorded(StoredRef),
    NotRecorded { reason: String },
}

impl HistoryStatus {
    pub fn is_recorded(&self) -> bool {
        matches!(self, HistoryStatus::Recorded(_))
    }
}

/// Successful result handed back to the caller.
#[derive(Debug, Clone)]
pub struct Completion {
    pub request_id: RequestId,
    pub backend: BackendKind,
    pub output: BackendOutput,
    pub duration_ms: f64,
    pub history: HistoryStatus,
}

pub(crate) type Reply = oneshot::Sender<Result<Completion>>;

/// A request sitting in a backend queue together with its reply channel.
pub(crate) struct QueuedRequest {
    pub request: Request,
    pub reply: Reply,
}

impl QueuedRequest {
    /// The caller dropped its ticket; nobody is waiting for the answer.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// Handle on an admitted request. Dropping it abandons the request if it has
/// not started yet.
#[derive(Debug)]
pub struct Ticket {
    pub id: RequestId,
    pub backend: BackendKind,
    pub(crate) rx: oneshot::Receiver<Result<Completion>>,
}

impl Ticket {
    /// Wait for the request to reach a terminal state.
    pub async fn wait(self) -> Result<Completion> {
        self.rx
            .await
            .map_err(|_| Error::Cancelled(format!("request {} on {}", self.id, self.backend)))?
    }
}
