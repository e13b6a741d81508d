//! Resident Core - Resident-Model Orchestrator
//!
//! Hosts a fixed set of heavyweight inference backends (speech recognition,
//! speech synthesis, translation, image generation, vision) behind one
//! process that owns a single shared accelerator.
//!
//! # Architecture
//!
//! - Each backend has a lifecycle state machine and a bounded admission queue
//!   served by its own worker
//! - Exclusive-class backends take a slot from a fair accelerator arbiter
//!   around every load and call; independent backends bypass it
//! - Pause / resume / restart control each backend without touching the others
//! - Every request that reaches a terminal state is appended to a
//!   date-partitioned history on disk
//!
//! # Example
//!
//! ```ignore
//! use resident_core::{Orchestrator, OrchestratorConfig};
//!
//! let orchestrator = Orchestrator::from_config(OrchestratorConfig::default())?;
//! let completion = orchestrator
//!     .handle("translate", serde_json::json!({ "text": "bonjour", "target": "en" }))
//!     .await?;
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod inference;

pub use backend::{
    BackendExecutor, BackendHandle, BackendKind, BackendOutput, BackendState, ConcurrencyClass,
    Payload, StateChange,
};
pub use config::{BackendConfig, OrchestratorConfig, PausePolicy, RunnerConfig, ServerConfig};
pub use engine::{
    BackendStatus, Completion, HealthReport, HistoryStatus, Orchestrator, RequestId, Ticket,
};
pub use error::{Error, ErrorKind, Result};
pub use history::{HistoryRecord, HistoryStore, Outcome};
