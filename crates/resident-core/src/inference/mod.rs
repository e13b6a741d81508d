//! Runners that host the model-specific inference code out of process.

mod daemon;
mod process;
pub mod protocol;

pub use daemon::DaemonExecutor;
pub use process::ProcessExecutor;

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendExecutor, BackendKind};
use crate::config::{BackendConfig, RunnerConfig};

/// Build the executor described by a backend's runner configuration.
///
/// Runners are bounded by the backend's own timeouts so a stuck call gives
/// the accelerator back when the caller stops waiting.
pub fn executor_for(kind: BackendKind, config: &BackendConfig) -> Arc<dyn BackendExecutor> {
    let call_timeout = Duration::from_millis(config.timeout_ms);
    let load_timeout = Duration::from_millis(config.load_timeout_ms);
    match config.runner_for(kind) {
        RunnerConfig::Daemon {
            socket,
            command,
            startup_timeout_ms,
        } => Arc::new(
            DaemonExecutor::new(kind, socket, command)
                .with_startup_timeout(Duration::from_millis(startup_timeout_ms))
                .with_call_timeout(call_timeout)
                .with_load_timeout(load_timeout),
        ),
        RunnerConfig::Process { command } => Arc::new(
            ProcessExecutor::new(kind, command)
                .with_call_timeout(call_timeout)
                .with_load_timeout(load_timeout),
        ),
    }
}
