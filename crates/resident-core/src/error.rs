//! Error types for the resident-model orchestrator

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendKind, BackendState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Backend {backend} unavailable (state: {state})")]
    BackendUnavailable {
        backend: BackendKind,
        state: BackendState,
    },

    #[error("Backend {backend} busy: queue full ({capacity} waiting)")]
    BackendBusy { backend: BackendKind, capacity: usize },

    #[error("Inference error: {0}")]
    InferenceError(String),

    /// Inference failed in a way that leaves the backend's internal state unknown.
    #[error("Backend fault: {0}")]
    BackendFault(String),

    #[error("Backend {backend} timed out after {elapsed_ms}ms")]
    Timeout { backend: BackendKind, elapsed_ms: u64 },

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Model loading failed: {0}")]
    ModelLoadError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error tag persisted in history records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    BackendUnavailable,
    BackendBusy,
    InferenceError,
    Timeout,
    PersistenceError,
    Cancelled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) | Error::NotFound(_) => ErrorKind::InvalidInput,
            Error::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Error::BackendBusy { .. } => ErrorKind::BackendBusy,
            Error::InferenceError(_) | Error::BackendFault(_) => ErrorKind::InferenceError,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::PersistenceError(_) => ErrorKind::PersistenceError,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::ModelLoadError(_)
            | Error::ConfigError(_)
            | Error::IoError(_)
            | Error::SerializationError(_) => ErrorKind::Internal,
        }
    }

    /// Whether the backend must be restarted before it serves again.
    pub fn poisons_backend(&self) -> bool {
        matches!(self, Error::BackendFault(_) | Error::Timeout { .. })
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::ConfigError(e.to_string())
    }
}
