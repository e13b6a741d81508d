//! Backend lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a resident backend.
///
/// ```text
/// unloaded -> loading -> ready <-> paused
///                  \       |        |
///                   +-> failed <----+
/// ```
///
/// `failed` is left only through a restart (`failed -> unloaded -> loading`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Unloaded,
    Loading,
    Ready,
    Paused,
    Failed,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Unloaded => "unloaded",
            BackendState::Loading => "loading",
            BackendState::Ready => "ready",
            BackendState::Paused => "paused",
            BackendState::Failed => "failed",
        }
    }

    /// Only a ready backend admits and executes requests.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, BackendState::Ready)
    }

    pub fn can_transition_to(&self, next: BackendState) -> bool {
        use BackendState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Ready)
                | (Loading, Failed)
                | (Ready, Paused)
                | (Ready, Failed)
                | (Ready, Unloaded)
                | (Paused, Ready)
                | (Paused, Loading)
                | (Paused, Unloaded)
                | (Paused, Failed)
                | (Failed, Loading)
                | (Failed, Unloaded)
        )
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
