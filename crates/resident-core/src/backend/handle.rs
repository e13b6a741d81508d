//! One resident backend: state machine, per-backend serialization and the
//! bounded `invoke` path.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use super::executor::{BackendExecutor, BackendOutput, Payload};
use super::kind::{BackendKind, ConcurrencyClass};
use super::state::BackendState;
use crate::config::{BackendConfig, PausePolicy};
use crate::engine::ResourceArbiter;
use crate::error::{Error, Result};

/// A lifecycle transition, broadcast to observers.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub backend: BackendKind,
    pub from: BackendState,
    pub to: BackendState,
    pub at: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct Detail {
    last_error: Option<String>,
    resident: bool,
}

pub struct BackendHandle {
    kind: BackendKind,
    class: ConcurrencyClass,
    pause_policy: PausePolicy,
    timeout: Duration,
    load_timeout: Duration,
    executor: Arc<dyn BackendExecutor>,
    state: watch::Sender<BackendState>,
    events: broadcast::Sender<StateChange>,
    detail: Mutex<Detail>,
    in_flight: Arc<AtomicUsize>,
    /// Held for the whole of any executor call, so at most one call per
    /// backend touches the model at a time.
    exec_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Decrements the in-flight counter when the executor call really ends,
/// which may be long after the caller gave up on a timeout.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BackendHandle {
    /// `events` may be shared between handles to get one combined stream.
    pub fn new(
        kind: BackendKind,
        config: &BackendConfig,
        executor: Arc<dyn BackendExecutor>,
        events: broadcast::Sender<StateChange>,
    ) -> Self {
        let (state, _) = watch::channel(BackendState::Unloaded);
        Self {
            kind,
            class: config.class,
            pause_policy: config.pause_policy,
            timeout: Duration::from_millis(config.timeout_ms),
            load_timeout: Duration::from_millis(config.load_timeout_ms),
            executor,
            state,
            events,
            detail: Mutex::new(Detail::default()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn class(&self) -> ConcurrencyClass {
        self.class
    }

    pub fn pause_policy(&self) -> PausePolicy {
        self.pause_policy
    }

    pub fn state(&self) -> BackendState {
        *self.state.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.detail().last_error.clone()
    }

    /// Whether model resources are currently held.
    pub fn is_resident(&self) -> bool {
        self.detail().resident
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stream of every transition from now on (of every handle sharing the sender).
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Suspend until the state satisfies `predicate`.
    pub async fn wait_for_state(&self, predicate: impl FnMut(&BackendState) -> bool) -> BackendState {
        let mut rx = self.state.subscribe();
        let reached = rx.wait_for(predicate).await.map(|state| *state);
        reached.unwrap_or_else(|_| self.state())
    }

    pub fn ensure_ready(&self) -> Result<()> {
        let state = self.state();
        if state.accepts_requests() {
            Ok(())
        } else {
            Err(Error::BackendUnavailable {
                backend: self.kind,
                state,
            })
        }
    }

    /// Move to `to` if the state machine allows it, returning the previous state.
    pub fn transition(&self, to: BackendState) -> Result<BackendState> {
        let mut current = to;
        let mut moved = false;
        self.state.send_if_modified(|state| {
            current = *state;
            if state.can_transition_to(to) {
                *state = to;
                moved = true;
            }
            moved
        });

        if !moved {
            return Err(Error::BackendUnavailable {
                backend: self.kind,
                state: current,
            });
        }

        info!("Backend {}: {} -> {}", self.kind, current, to);
        let error = if to == BackendState::Failed {
            self.last_error()
        } else {
            None
        };
        // No subscribers is fine.
        let _ = self.events.send(StateChange {
            backend: self.kind,
            from: current,
            to,
            at: Local::now(),
            error,
        });
        Ok(current)
    }

    /// Record `reason` and move to `failed`.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!("Backend {} failed: {}", self.kind, reason);
        self.detail().last_error = Some(reason);
        if let Err(err) = self.transition(BackendState::Failed) {
            warn!("Backend {} could not enter failed state: {}", self.kind, err);
        }
    }

    /// Run one inference call. Only valid while `ready`.
    ///
    /// The call holds this backend's execution lock and, for exclusive
    /// backends, an accelerator permit until the executor really returns,
    /// even if the caller has already seen a timeout.
    pub async fn invoke(&self, payload: Payload, arbiter: &ResourceArbiter) -> Result<BackendOutput> {
        self.ensure_ready()?;
        let exec_guard = self.exec_lock.clone().lock_owned().await;
        let permit = arbiter.acquire(self.kind, self.class).await?;
        // A lifecycle operation may have run while we waited.
        self.ensure_ready()?;

        let executor = self.executor.clone();
        let in_flight = InFlight::enter(self.in_flight.clone());
        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || {
            // Dropped in reverse: in-flight, permit, then the execution lock.
            let _exec_guard = exec_guard;
            let _permit = permit;
            let _in_flight = in_flight;
            executor.execute(&payload)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => {
                if let Err(err) = &result {
                    if err.poisons_backend() {
                        self.fail(err.to_string());
                    } else {
                        warn!("Backend {} inference failed: {}", self.kind, err);
                    }
                }
                result
            }
            Ok(Err(join_err)) => {
                let err = Error::BackendFault(format!("executor panicked: {}", join_err));
                self.fail(err.to_string());
                Err(err)
            }
            Err(_) => {
                let err = Error::Timeout {
                    backend: self.kind,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                self.fail(err.to_string());
                Err(err)
            }
        }
    }

    /// Bring the model resident: `-> loading -> ready | failed`.
    /// A caller may already have moved the backend to `loading`.
    pub async fn load(&self, arbiter: &ResourceArbiter) -> Result<()> {
        if self.state() != BackendState::Loading {
            self.transition(BackendState::Loading)?;
        }
        let started = Instant::now();

        let exec_guard = self.exec_lock.clone().lock_owned().await;
        let permit = match arbiter.acquire(self.kind, self.class).await {
            Ok(permit) => permit,
            Err(err) => {
                self.fail(err.to_string());
                return Err(err);
            }
        };

        let executor = self.executor.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _exec_guard = exec_guard;
            let _permit = permit;
            executor.load()
        });

        let result = match tokio::time::timeout(self.load_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::ModelLoadError(format!(
                "loader panicked: {}",
                join_err
            ))),
            Err(_) => Err(Error::ModelLoadError(format!(
                "load exceeded {}ms",
                self.load_timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                {
                    let mut detail = self.detail();
                    detail.resident = true;
                    detail.last_error = None;
                }
                self.transition(BackendState::Ready)?;
                info!("Backend {} loaded in {:?}", self.kind, started.elapsed());
                Ok(())
            }
            Err(err) => {
                self.fail(err.to_string());
                Err(err)
            }
        }
    }

    /// Release model resources once any running call has finished.
    /// Does not change the lifecycle state.
    pub async fn unload(&self) -> Result<()> {
        let exec_guard = self.exec_lock.clone().lock_owned().await;
        let executor = self.executor.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _exec_guard = exec_guard;
            executor.unload()
        })
        .await
        .map_err(|e| Error::ModelLoadError(format!("unloader panicked: {}", e)))?;

        self.detail().resident = false;
        match &result {
            Ok(()) => info!("Backend {} unloaded", self.kind),
            Err(err) => warn!("Backend {} unload reported: {}", self.kind, err),
        }
        result
    }

    /// Wait until no executor call is running on this backend.
    pub async fn quiesce(&self) {
        let _guard = self.exec_lock.lock().await;
    }

    fn detail(&self) -> MutexGuard<'_, Detail> {
        self.detail.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    struct Echo {
        fail_load: AtomicBool,
        delay: Duration,
    }

    impl Echo {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                fail_load: AtomicBool::new(false),
                delay: Duration::from_millis(delay_ms),
            })
        }
    }

    impl BackendExecutor for Echo {
        fn load(&self) -> Result<()> {
            if self.fail_load.load(Ordering::SeqCst) {
                return Err(Error::ModelLoadError("weights missing".into()));
            }
            Ok(())
        }

        fn execute(&self, payload: &Payload) -> Result<BackendOutput> {
            std::thread::sleep(self.delay);
            if payload.body().get("fatal").is_some() {
                return Err(Error::BackendFault("device lost".into()));
            }
            if payload.body().get("bad").is_some() {
                return Err(Error::InferenceError("unsupported language".into()));
            }
            Ok(BackendOutput::json(payload.body().clone()))
        }

        fn unload(&self) -> Result<()> {
            Ok(())
        }
    }

    fn config(timeout_ms: u64) -> BackendConfig {
        BackendConfig {
            timeout_ms,
            ..BackendConfig::default()
        }
    }

    fn payload(value: serde_json::Value) -> Payload {
        Payload::from_json(value).unwrap()
    }

    fn make_handle(kind: BackendKind, timeout_ms: u64, executor: Arc<Echo>) -> BackendHandle {
        let (events, _) = broadcast::channel(16);
        BackendHandle::new(kind, &config(timeout_ms), executor, events)
    }

    #[tokio::test]
    async fn test_invoke_requires_ready() {
        let arbiter = ResourceArbiter::new(1);
        let handle = make_handle(BackendKind::Asr, 1_000, Echo::new(0));

        let err = handle
            .invoke(payload(json!({"text": "hi"})), &arbiter)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BackendUnavailable {
                state: BackendState::Unloaded,
                ..
            }
        ));

        handle.load(&arbiter).await.unwrap();
        assert!(handle.is_resident());
        let out = handle
            .invoke(payload(json!({"text": "hi"})), &arbiter)
            .await
            .unwrap();
        assert_eq!(out.body["text"], "hi");
        assert_eq!(handle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_load_failure_records_error() {
        let arbiter = ResourceArbiter::new(1);
        let executor = Echo::new(0);
        executor.fail_load.store(true, Ordering::SeqCst);
        let handle = make_handle(BackendKind::Image, 1_000, executor);

        assert!(handle.load(&arbiter).await.is_err());
        assert_eq!(handle.state(), BackendState::Failed);
        assert!(handle.last_error().unwrap().contains("weights missing"));
    }

    #[tokio::test]
    async fn test_plain_inference_error_keeps_ready() {
        let arbiter = ResourceArbiter::new(1);
        let handle = make_handle(BackendKind::Translate, 1_000, Echo::new(0));
        handle.load(&arbiter).await.unwrap();

        let err = handle
            .invoke(payload(json!({"bad": true})), &arbiter)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InferenceError(_)));
        assert_eq!(handle.state(), BackendState::Ready);

        let err = handle
            .invoke(payload(json!({"fatal": true})), &arbiter)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendFault(_)));
        assert_eq!(handle.state(), BackendState::Failed);
    }

    #[tokio::test]
    async fn test_timeout_fails_backend() {
        let arbiter = ResourceArbiter::new(1);
        let handle = make_handle(BackendKind::Asr, 20, Echo::new(200));
        handle.load(&arbiter).await.unwrap();

        let err = handle
            .invoke(payload(json!({"text": "slow"})), &arbiter)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(handle.state(), BackendState::Failed);
        // The abandoned call still owns the accelerator until it returns.
        assert_eq!(handle.in_flight(), 1);
        assert_eq!(arbiter.available(), 0);

        handle.quiesce().await;
        assert_eq!(handle.in_flight(), 0);
        assert_eq!(arbiter.available(), 1);
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let arbiter = ResourceArbiter::new(1);
        let handle = make_handle(BackendKind::Tts, 1_000, Echo::new(0));
        let mut events = handle.subscribe();

        handle.load(&arbiter).await.unwrap();
        handle.transition(BackendState::Paused).unwrap();

        let seen: Vec<_> = (0..3)
            .map(|_| events.try_recv().unwrap())
            .map(|change| (change.from, change.to))
            .collect();
        assert_eq!(
            seen,
            vec![
                (BackendState::Unloaded, BackendState::Loading),
                (BackendState::Loading, BackendState::Ready),
                (BackendState::Ready, BackendState::Paused),
            ]
        );

        assert!(handle.transition(BackendState::Paused).is_err());
    }
}
