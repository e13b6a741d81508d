//! Resident inference backends and their lifecycle state

mod executor;
mod handle;
mod kind;
mod state;

pub use executor::{ArtifactData, BackendExecutor, BackendOutput, Payload};
pub use handle::{BackendHandle, StateChange};
pub use kind::{BackendKind, ConcurrencyClass};
pub use state::BackendState;
