//! The resident-model orchestrator: process-scoped owner of every hosted
//! backend, its queue and worker, the accelerator arbiter and the history
//! store.
//!
//! Control flow for one request:
//!
//! ```text
//! submit -> RequestQueue (admit | BackendBusy | BackendUnavailable)
//!        -> worker -> ResourceArbiter (exclusive only) -> BackendHandle::invoke
//!        -> HistoryStore::append -> caller
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::arbiter::ResourceArbiter;
use super::lifecycle::LifecycleManager;
use super::queue::RequestQueue;
use super::registry::{BackendSlot, BackendStatus, Registry};
use super::request::{Completion, QueuedRequest, Request, RequestId, Ticket};
use super::worker::{self, EngineContext};
use crate::backend::{BackendExecutor, BackendHandle, BackendKind, BackendState, Payload, StateChange};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::history::{HistoryRecord, HistoryStore};
use crate::inference;

const EVENT_CAPACITY: usize = 256;

/// Accelerator occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct AcceleratorStatus {
    pub slots: usize,
    pub available: usize,
}

/// Snapshot of every hosted backend.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub backends: Vec<BackendStatus>,
    pub accelerator: AcceleratorStatus,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<Registry>,
    ctx: Arc<EngineContext>,
    lifecycle: LifecycleManager,
    events: broadcast::Sender<StateChange>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build executors from each backend's runner configuration and start.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let executors = config
            .enabled_backends()
            .map(|(kind, backend)| (kind, inference::executor_for(kind, backend)))
            .collect();
        Self::start(config, executors)
    }

    /// Register every enabled backend, spawn its worker and begin loading it.
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: OrchestratorConfig,
        mut executors: HashMap<BackendKind, Arc<dyn BackendExecutor>>,
    ) -> Result<Self> {
        config.validate()?;

        let ctx = Arc::new(EngineContext {
            arbiter: ResourceArbiter::new(config.accelerator_slots),
            history: HistoryStore::open(&config.history_dir)?,
            summary_max_chars: config.summary_max_chars,
        });

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut registry = Registry::default();
        for (kind, backend) in config.enabled_backends() {
            let executor = executors
                .remove(&kind)
                .ok_or_else(|| Error::ConfigError(format!("No executor for backend {}", kind)))?;
            registry.insert(BackendSlot {
                handle: BackendHandle::new(kind, backend, executor, events.clone()),
                queue: RequestQueue::new(kind, backend.queue_capacity),
                ops: Arc::new(tokio::sync::Mutex::new(())),
            });
        }
        let registry = Arc::new(registry);
        let lifecycle = LifecycleManager::new(registry.clone(), ctx.clone());

        let mut workers = Vec::new();
        for slot in registry.iter() {
            info!(
                "Registered backend {} ({}, queue {})",
                slot.handle.kind(),
                slot.handle.class(),
                slot.queue.capacity()
            );
            workers.push(tokio::spawn(worker::run_worker(slot.clone(), ctx.clone())));
            lifecycle.spawn_initial_load(slot.clone());
        }

        Ok(Self {
            config,
            registry,
            ctx,
            lifecycle,
            events,
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Admit a request. Never waits for the backend.
    pub fn submit(&self, backend: &str, payload: serde_json::Value) -> Result<Ticket> {
        let kind: BackendKind = backend.parse()?;
        self.submit_to(kind, Payload::from_json(payload)?)
    }

    pub fn submit_to(&self, kind: BackendKind, payload: Payload) -> Result<Ticket> {
        let slot = self.registry.get(kind)?;
        slot.handle.ensure_ready()?;

        let request = Request::new(kind, payload);
        let id = request.id;
        let (reply, rx) = oneshot::channel();
        slot.queue
            .push(QueuedRequest { request, reply })
            .map_err(|(err, _)| err)?;

        Ok(Ticket {
            id,
            backend: kind,
            rx,
        })
    }

    /// Submit and wait for the terminal state.
    pub async fn handle(&self, backend: &str, payload: serde_json::Value) -> Result<Completion> {
        self.submit(backend, payload)?.wait().await
    }

    /// Withdraw a request that has not started. Returns whether it was found.
    pub fn cancel(&self, kind: BackendKind, id: &RequestId) -> Result<bool> {
        // Dropping the queued entry closes the ticket with `Cancelled`.
        Ok(self.registry.get(kind)?.queue.cancel(id).is_some())
    }

    pub async fn pause(&self, backend: &str) -> Result<BackendState> {
        self.lifecycle.pause(backend.parse()?).await
    }

    pub async fn resume(&self, backend: &str) -> Result<BackendState> {
        self.lifecycle.resume(backend.parse()?).await
    }

    pub async fn restart(&self, backend: &str) -> Result<()> {
        self.lifecycle.restart(backend.parse()?).await
    }

    pub fn status(&self, backend: &str) -> Result<BackendStatus> {
        self.lifecycle.status(backend.parse()?)
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            backends: self.registry.iter().map(|slot| slot.status()).collect(),
            accelerator: AcceleratorStatus {
                slots: self.ctx.arbiter.slots(),
                available: self.ctx.arbiter.available(),
            },
        }
    }

    /// Suspend until `backend` reaches a state matching `predicate`.
    pub async fn wait_for_state(
        &self,
        kind: BackendKind,
        predicate: impl FnMut(&BackendState) -> bool,
    ) -> Result<BackendState> {
        let slot = self.registry.get(kind)?;
        Ok(slot.handle.wait_for_state(predicate).await)
    }

    /// Lifecycle transitions of every backend, from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    pub async fn history(&self, date: &str) -> Result<Vec<HistoryRecord>> {
        self.ctx.history.read(date).await
    }

    pub async fn dates(&self) -> Result<Vec<String>> {
        self.ctx.history.dates().await
    }

    pub fn artifact_path(&self, date: &str, name: &str) -> Result<PathBuf> {
        self.ctx.history.artifact_path(date, name)
    }

    /// Stop admitting, refuse waiting requests, let running ones finish and
    /// unload every backend.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.lifecycle.stop();
        for slot in self.registry.iter() {
            let state = slot.handle.state();
            for queued in slot.queue.close() {
                let err = Error::BackendUnavailable {
                    backend: slot.handle.kind(),
                    state,
                };
                worker::reject(&self.ctx, queued, err).await;
            }
        }

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!("Worker ended abnormally: {}", err);
            }
        }

        self.lifecycle.unload_all().await;
        info!("Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOutput, ConcurrencyClass};
    use crate::config::BackendConfig;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    struct Upper;

    impl BackendExecutor for Upper {
        fn load(&self) -> Result<()> {
            Ok(())
        }

        fn execute(&self, payload: &Payload) -> Result<BackendOutput> {
            let text = payload.body()["text"].as_str().unwrap_or_default();
            Ok(BackendOutput::json(json!({ "text": text.to_uppercase() })))
        }

        fn unload(&self) -> Result<()> {
            Ok(())
        }
    }

    fn start(dir: &std::path::Path) -> Orchestrator {
        let mut backends = BTreeMap::new();
        backends.insert(BackendKind::Translate, BackendConfig::default());
        backends.insert(
            BackendKind::Vision,
            BackendConfig {
                class: ConcurrencyClass::Independent,
                ..BackendConfig::default()
            },
        );
        let config = OrchestratorConfig {
            history_dir: dir.to_path_buf(),
            backends,
            ..OrchestratorConfig::default()
        };
        let executors: HashMap<BackendKind, Arc<dyn BackendExecutor>> = [
            (BackendKind::Translate, Arc::new(Upper) as Arc<dyn BackendExecutor>),
            (BackendKind::Vision, Arc::new(Upper) as Arc<dyn BackendExecutor>),
        ]
        .into_iter()
        .collect();
        Orchestrator::start(config, executors).unwrap()
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let dir = tempdir().unwrap();
        let orchestrator = start(dir.path());
        orchestrator
            .wait_for_state(BackendKind::Translate, |s| *s == BackendState::Ready)
            .await
            .unwrap();

        let completion = orchestrator
            .handle("translate", json!({ "text": "bonjour" }))
            .await
            .unwrap();
        assert_eq!(completion.output.body["text"], "BONJOUR");
        assert!(completion.history.is_recorded());

        let dates = orchestrator.dates().await.unwrap();
        let records = orchestrator.history(&dates[0]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].input_summary, "bonjour");
        assert_eq!(records[0].output_summary.as_deref(), Some("BONJOUR"));

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_backends() {
        let dir = tempdir().unwrap();
        let orchestrator = start(dir.path());

        assert!(matches!(
            orchestrator.submit("ocr", json!({})),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            orchestrator.submit("asr", json!({})),
            Err(Error::InvalidInput(_))
        ));
        orchestrator
            .wait_for_state(BackendKind::Vision, |s| *s == BackendState::Ready)
            .await
            .unwrap();
        assert!(matches!(
            orchestrator.submit("vision", json!("not an object")),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_health_reports_every_backend() {
        let dir = tempdir().unwrap();
        let orchestrator = start(dir.path());
        orchestrator
            .wait_for_state(BackendKind::Vision, |s| *s == BackendState::Ready)
            .await
            .unwrap();

        let health = orchestrator.health();
        assert_eq!(health.backends.len(), 2);
        assert_eq!(health.backends[0].backend, BackendKind::Translate);
        assert_eq!(health.accelerator.slots, 1);
        let vision = orchestrator.status("vision").unwrap();
        assert_eq!(vision.class, ConcurrencyClass::Independent);
        assert_eq!(vision.state, BackendState::Ready);
        assert_eq!(vision.in_flight, 0);
    }

    #[tokio::test]
    async fn test_missing_executor_is_config_error() {
        let dir = tempdir().unwrap();
        let config = OrchestratorConfig {
            history_dir: dir.path().to_path_buf(),
            ..OrchestratorConfig::default()
        };
        let err = Orchestrator::start(config, HashMap::new()).err().unwrap();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
