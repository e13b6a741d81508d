//! Configuration types for the resident-model orchestrator

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::backend::{BackendKind, ConcurrencyClass};
use crate::error::{Error, Result};

/// Main orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Root of the date-partitioned request history
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,

    /// How many exclusive-class calls may use the accelerator at once
    #[serde(default = "default_accelerator_slots")]
    pub accelerator_slots: usize,

    /// Maximum characters kept for input/output summaries in history
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,

    /// Hosted backends. Backends absent from this table are not served.
    #[serde(default = "default_backends")]
    pub backends: BTreeMap<BackendKind, BackendConfig>,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_dir: default_history_dir(),
            accelerator_slots: default_accelerator_slots(),
            summary_max_chars: default_summary_max_chars(),
            backends: default_backends(),
            server: ServerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<()> {
        if self.accelerator_slots == 0 {
            return Err(Error::ConfigError(
                "accelerator_slots must be at least 1".to_string(),
            ));
        }
        if self.summary_max_chars == 0 {
            return Err(Error::ConfigError(
                "summary_max_chars must be at least 1".to_string(),
            ));
        }
        for (kind, backend) in &self.backends {
            backend
                .validate()
                .map_err(|e| Error::ConfigError(format!("backends.{}: {}", kind, e)))?;
        }
        Ok(())
    }

    /// Backends that should be registered at startup.
    pub fn enabled_backends(&self) -> impl Iterator<Item = (BackendKind, &BackendConfig)> {
        self.backends
            .iter()
            .filter(|(_, backend)| backend.enabled)
            .map(|(kind, backend)| (*kind, backend))
    }
}

fn default_history_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("resident")
        .join("history")
}

fn default_accelerator_slots() -> usize {
    1
}

fn default_summary_max_chars() -> usize {
    512
}

fn default_backends() -> BTreeMap<BackendKind, BackendConfig> {
    BackendKind::all()
        .iter()
        .map(|kind| (*kind, BackendConfig::default()))
        .collect()
}

/// What happens to model resources while a backend is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PausePolicy {
    /// Keep weights resident; resume is instant
    #[default]
    Retain,
    /// Free weights on pause; resume reloads
    Release,
}

/// Per-backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub class: ConcurrencyClass,

    /// Requests allowed to wait behind the running one
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bound on a single inference call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on bringing the model resident
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,

    #[serde(default)]
    pub pause_policy: PausePolicy,

    /// How to reach the inference code. Defaults to a daemon socket.
    #[serde(default)]
    pub runner: Option<RunnerConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            class: ConcurrencyClass::default(),
            queue_capacity: default_queue_capacity(),
            timeout_ms: default_timeout_ms(),
            load_timeout_ms: default_load_timeout_ms(),
            pause_policy: PausePolicy::default(),
            runner: None,
        }
    }
}

impl BackendConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".to_string());
        }
        if self.timeout_ms == 0 || self.load_timeout_ms == 0 {
            return Err("timeouts must be greater than zero".to_string());
        }
        if let Some(RunnerConfig::Process { command }) = &self.runner {
            if command.is_empty() {
                return Err("process runner needs a command".to_string());
            }
        }
        Ok(())
    }

    /// The configured runner, or a daemon on the conventional socket path.
    pub fn runner_for(&self, kind: BackendKind) -> RunnerConfig {
        self.runner.clone().unwrap_or_else(|| RunnerConfig::Daemon {
            socket: PathBuf::from(format!("/tmp/resident_{}_daemon.sock", kind)),
            command: Vec::new(),
            startup_timeout_ms: default_startup_timeout_ms(),
        })
    }
}

fn default_enabled() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    16
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_load_timeout_ms() -> u64 {
    300_000
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}

/// Transport to the model-specific inference code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunnerConfig {
    /// Persistent daemon on a Unix socket, optionally started by us
    Daemon {
        socket: PathBuf,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default = "default_startup_timeout_ms")]
        startup_timeout_ms: u64,
    },
    /// One process per call, JSON on stdin and stdout
    Process { command: Vec<String> },
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,

    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
            cors_origins: vec!["*".to_string()],
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18321
}

fn default_cors_enabled() -> bool {
    true
}
