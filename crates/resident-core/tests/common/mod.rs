//! Shared fixtures for the orchestrator integration tests.

#![allow(dead_code)]

use resident_core::{
    BackendConfig, BackendExecutor, BackendKind, BackendOutput, BackendState, ConcurrencyClass,
    Error, HistoryRecord, Orchestrator, OrchestratorConfig, Payload, Result,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One executor call as seen by the probe.
#[derive(Debug, Clone)]
pub struct Span {
    pub backend: BackendKind,
    pub class: ConcurrencyClass,
    pub start: Instant,
    pub end: Instant,
}

impl Span {
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Records what every fake executor does, across backends.
#[derive(Default)]
pub struct Probe {
    spans: Mutex<Vec<Span>>,
    loads: Mutex<Vec<BackendKind>>,
    unloads: Mutex<Vec<BackendKind>>,
    exclusive_active: AtomicUsize,
    exclusive_peak: AtomicUsize,
}

impl Probe {
    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }

    pub fn spans_of(&self, backend: BackendKind) -> Vec<Span> {
        self.spans()
            .into_iter()
            .filter(|span| span.backend == backend)
            .collect()
    }

    pub fn exclusive_peak(&self) -> usize {
        self.exclusive_peak.load(Ordering::SeqCst)
    }

    pub fn loads(&self, backend: BackendKind) -> usize {
        self.loads.lock().unwrap().iter().filter(|k| **k == backend).count()
    }

    pub fn unloads(&self, backend: BackendKind) -> usize {
        self.unloads.lock().unwrap().iter().filter(|k| **k == backend).count()
    }
}

/// Fake model. The payload drives it:
/// `sleep_ms` holds the call, `fail` reports an inference error,
/// `fatal` a backend fault and `artifact` attaches a file.
pub struct FakeExecutor {
    backend: BackendKind,
    class: ConcurrencyClass,
    load_delay: Duration,
    probe: Arc<Probe>,
}

impl BackendExecutor for FakeExecutor {
    fn load(&self) -> Result<()> {
        std::thread::sleep(self.load_delay);
        self.probe.loads.lock().unwrap().push(self.backend);
        Ok(())
    }

    fn execute(&self, payload: &Payload) -> Result<BackendOutput> {
        let body = payload.body();
        let exclusive = self.class == ConcurrencyClass::Exclusive;
        if exclusive {
            let now = self.probe.exclusive_active.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.exclusive_peak.fetch_max(now, Ordering::SeqCst);
        }

        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(body["sleep_ms"].as_u64().unwrap_or(0)));
        let end = Instant::now();

        if exclusive {
            self.probe.exclusive_active.fetch_sub(1, Ordering::SeqCst);
        }
        self.probe.spans.lock().unwrap().push(Span {
            backend: self.backend,
            class: self.class,
            start,
            end,
        });

        if body["fatal"].as_bool().unwrap_or(false) {
            return Err(Error::BackendFault("device lost".to_string()));
        }
        if body["fail"].as_bool().unwrap_or(false) {
            return Err(Error::InferenceError("unsupported input".to_string()));
        }

        let text = body["text"].as_str().unwrap_or_default();
        let output = BackendOutput::json(json!({ "text": text.to_uppercase() }));
        if body["artifact"].as_bool().unwrap_or(false) {
            return Ok(output.with_artifact(text.as_bytes().to_vec(), "out.txt"));
        }
        Ok(output)
    }

    fn unload(&self) -> Result<()> {
        self.probe.unloads.lock().unwrap().push(self.backend);
        Ok(())
    }
}

/// All five backends: vision independent, the rest exclusive.
pub fn backends() -> BTreeMap<BackendKind, BackendConfig> {
    BackendKind::all()
        .iter()
        .map(|kind| {
            let class = if *kind == BackendKind::Vision {
                ConcurrencyClass::Independent
            } else {
                ConcurrencyClass::Exclusive
            };
            (
                *kind,
                BackendConfig {
                    class,
                    timeout_ms: 10_000,
                    ..BackendConfig::default()
                },
            )
        })
        .collect()
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub probe: Arc<Probe>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn start(backends: BTreeMap<BackendKind, BackendConfig>) -> Self {
        Self::start_with_load_delay(backends, Duration::ZERO)
    }

    pub fn start_with_load_delay(
        backends: BTreeMap<BackendKind, BackendConfig>,
        load_delay: Duration,
    ) -> Self {
        Self::build(backends, load_delay, HashMap::new())
    }

    /// Fakes everywhere except the backends given a real executor.
    pub fn start_with_executors(
        backends: BTreeMap<BackendKind, BackendConfig>,
        overrides: HashMap<BackendKind, Arc<dyn BackendExecutor>>,
    ) -> Self {
        Self::build(backends, Duration::ZERO, overrides)
    }

    fn build(
        backends: BTreeMap<BackendKind, BackendConfig>,
        load_delay: Duration,
        mut overrides: HashMap<BackendKind, Arc<dyn BackendExecutor>>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let executors: HashMap<BackendKind, Arc<dyn BackendExecutor>> = backends
            .iter()
            .map(|(kind, config)| {
                let executor: Arc<dyn BackendExecutor> = overrides.remove(kind).unwrap_or_else(|| {
                    Arc::new(FakeExecutor {
                        backend: *kind,
                        class: config.class,
                        load_delay,
                        probe: probe.clone(),
                    })
                });
                (*kind, executor)
            })
            .collect();
        let config = OrchestratorConfig {
            history_dir: dir.path().join("history"),
            backends,
            ..OrchestratorConfig::default()
        };

        Self {
            orchestrator: Orchestrator::start(config, executors).unwrap(),
            probe,
            _dir: dir,
        }
    }

    pub async fn wait_ready(&self, backend: BackendKind) {
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            self.orchestrator
                .wait_for_state(backend, |s| *s == BackendState::Ready),
        )
        .await
        .expect("backend never became ready")
        .unwrap();
        assert_eq!(state, BackendState::Ready);
    }

    pub async fn wait_all_ready(&self) {
        for status in self.orchestrator.health().backends {
            self.wait_ready(status.backend).await;
        }
    }

    /// Poll until `backend` is running a call and nothing waits behind it.
    pub async fn wait_running(&self, backend: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = self.orchestrator.status(backend).unwrap();
            if status.in_flight == 1 && status.queued == 0 {
                return;
            }
            assert!(Instant::now() < deadline, "{} never started running", backend);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Every record across all dates, oldest date first.
    pub async fn records(&self) -> Vec<HistoryRecord> {
        let mut dates = self.orchestrator.dates().await.unwrap();
        dates.reverse();
        let mut records = Vec::new();
        for date in dates {
            records.extend(self.orchestrator.history(&date).await.unwrap());
        }
        records
    }
}

pub fn history_root(harness: &Harness) -> &Path {
    harness.orchestrator.config().history_dir.as_path()
}
