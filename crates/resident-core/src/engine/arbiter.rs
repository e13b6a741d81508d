//! Shared-accelerator gatekeeper.
//!
//! Exclusive-class backends must hold an [`AcceleratorPermit`] for the whole
//! duration of a load or an inference call. Permits come from a fair
//! semaphore, so waiters are served strictly in the order they asked and a
//! waiting call is parked rather than spinning. With the default single slot
//! this is a global mutex across all exclusive backends.
//!
//! Independent-class backends never touch the arbiter.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::backend::{BackendKind, ConcurrencyClass};
use crate::error::{Error, Result};

pub struct ResourceArbiter {
    slots: usize,
    semaphore: Arc<Semaphore>,
}

/// Exclusive access to (one slot of) the accelerator. Released on drop.
#[derive(Debug)]
pub struct AcceleratorPermit {
    backend: BackendKind,
    acquired_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl ResourceArbiter {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            slots,
            semaphore: Arc::new(Semaphore::new(slots)),
        }
    }

    /// Wait for the accelerator. Returns `None` for independent backends.
    pub async fn acquire(
        &self,
        backend: BackendKind,
        class: ConcurrencyClass,
    ) -> Result<Option<AcceleratorPermit>> {
        if class == ConcurrencyClass::Independent {
            return Ok(None);
        }

        let wait_start = Instant::now();
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::InferenceError("Accelerator arbiter is closed".to_string()))?;

        debug!(
            "Accelerator granted to {} after {:?} ({} of {} slots free)",
            backend,
            wait_start.elapsed(),
            self.semaphore.available_permits(),
            self.slots
        );

        Ok(Some(AcceleratorPermit {
            backend,
            acquired_at: Instant::now(),
            _permit: permit,
        }))
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl AcceleratorPermit {
    pub fn backend(&self) -> BackendKind {
        self.backend
    }
}

impl Drop for AcceleratorPermit {
    fn drop(&mut self) {
        debug!(
            "Accelerator released by {} after {:?}",
            self.backend,
            self.acquired_at.elapsed()
        );
    }
}
