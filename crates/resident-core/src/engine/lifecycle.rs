//! Pause / resume / restart per backend.
//!
//! Operations on one backend are serialized by that backend's `ops` mutex,
//! which hands out the lock in arrival order. Long-running reloads keep the
//! lock from a spawned task so the caller gets its acknowledgement right away
//! while later operations on the same backend still wait their turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::registry::{BackendSlot, BackendStatus, Registry};
use super::worker::{self, EngineContext};
use crate::backend::{BackendKind, BackendState};
use crate::config::PausePolicy;
use crate::error::{Error, Result};

pub struct LifecycleManager {
    registry: Arc<Registry>,
    ctx: Arc<EngineContext>,
    stopped: AtomicBool,
}

impl LifecycleManager {
    pub(crate) fn new(registry: Arc<Registry>, ctx: Arc<EngineContext>) -> Self {
        Self {
            registry,
            ctx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Refuse every later pause, resume and restart. Set before shutdown
    /// closes the queues.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self, slot: &BackendSlot) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::BackendUnavailable {
                backend: slot.handle.kind(),
                state: slot.handle.state(),
            });
        }
        Ok(())
    }

    /// `ready -> paused`. Stops admission, refuses whatever was waiting and
    /// lets the running call finish. Under the release policy the model is
    /// unloaded once that call is done.
    pub async fn pause(&self, kind: BackendKind) -> Result<BackendState> {
        let slot = self.registry.get(kind)?.clone();
        let _op = slot.ops.lock().await;
        self.ensure_running(&slot)?;

        if slot.handle.state() == BackendState::Paused {
            return Ok(BackendState::Paused);
        }
        slot.handle.transition(BackendState::Paused)?;
        self.reject_waiting(&slot, BackendState::Paused).await;

        if slot.handle.pause_policy() == PausePolicy::Release {
            if let Err(err) = slot.handle.unload().await {
                warn!("Backend {} did not release cleanly: {}", kind, err);
            }
        }

        info!("Backend {} paused", kind);
        Ok(BackendState::Paused)
    }

    /// `paused -> ready` when the model stayed resident, otherwise
    /// `paused -> loading` with the reload continuing in the background.
    pub async fn resume(&self, kind: BackendKind) -> Result<BackendState> {
        let slot = self.registry.get(kind)?.clone();
        let op = slot.ops.clone().lock_owned().await;
        self.ensure_running(&slot)?;

        match slot.handle.state() {
            BackendState::Ready => Ok(BackendState::Ready),
            BackendState::Paused if slot.handle.is_resident() => {
                slot.handle.transition(BackendState::Ready)?;
                info!("Backend {} resumed", kind);
                Ok(BackendState::Ready)
            }
            BackendState::Paused => {
                slot.handle.transition(BackendState::Loading)?;
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    let _op = op;
                    let _ = slot.handle.load(&ctx.arbiter).await;
                });
                Ok(BackendState::Loading)
            }
            state => Err(Error::BackendUnavailable {
                backend: kind,
                state,
            }),
        }
    }

    /// Pause, force an unload and reload, from any state. Returns once the
    /// restart is under way; the backend then moves through `unloaded` and
    /// `loading` to `ready` or `failed`.
    pub async fn restart(&self, kind: BackendKind) -> Result<()> {
        let slot = self.registry.get(kind)?.clone();
        let op = slot.ops.clone().lock_owned().await;
        self.ensure_running(&slot)?;

        let from = slot.handle.state();
        if from == BackendState::Ready {
            slot.handle.transition(BackendState::Paused)?;
        }
        self.reject_waiting(&slot, slot.handle.state()).await;
        info!("Restarting backend {} (was {})", kind, from);

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _op = op;
            // Waits for any running call, including one that already timed out.
            if let Err(err) = slot.handle.unload().await {
                warn!("Backend {} unload before restart: {}", kind, err);
            }
            if slot.handle.state() != BackendState::Unloaded {
                if let Err(err) = slot.handle.transition(BackendState::Unloaded) {
                    warn!("Backend {} restart aborted: {}", kind, err);
                    return;
                }
            }
            let _ = slot.handle.load(&ctx.arbiter).await;
        });
        Ok(())
    }

    pub fn status(&self, kind: BackendKind) -> Result<BackendStatus> {
        Ok(self.registry.get(kind)?.status())
    }

    /// Initial load at startup, ordered before any operator action.
    pub(crate) fn spawn_initial_load(&self, slot: Arc<BackendSlot>) {
        let op = match slot.ops.clone().try_lock_owned() {
            Ok(op) => op,
            Err(_) => {
                warn!("Backend {} busy at startup, skipping initial load", slot.handle.kind());
                return;
            }
        };
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _op = op;
            let _ = slot.handle.load(&ctx.arbiter).await;
        });
    }

    /// Unload everything. Waits for pending lifecycle operations and running calls.
    pub(crate) async fn unload_all(&self) {
        for slot in self.registry.iter() {
            let _op = slot.ops.lock().await;
            if slot.handle.is_resident() {
                if let Err(err) = slot.handle.unload().await {
                    warn!("Backend {} unload at shutdown: {}", slot.handle.kind(), err);
                }
            } else {
                slot.handle.quiesce().await;
            }
            if slot.handle.state() != BackendState::Unloaded {
                if slot.handle.state() == BackendState::Ready {
                    let _ = slot.handle.transition(BackendState::Paused);
                }
                let _ = slot.handle.transition(BackendState::Unloaded);
            }
        }
    }

    async fn reject_waiting(&self, slot: &BackendSlot, state: BackendState) {
        for queued in slot.queue.drain() {
            let err = Error::BackendUnavailable {
                backend: slot.handle.kind(),
                state,
            };
            worker::reject(&self.ctx, queued, err).await;
        }
    }
}
