//! Name to backend lookup for the hosted set.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::queue::RequestQueue;
use crate::backend::{BackendHandle, BackendKind, BackendState, ConcurrencyClass};
use crate::config::PausePolicy;
use crate::error::{Error, Result};

/// Everything owned by one hosted backend.
pub(crate) struct BackendSlot {
    pub handle: BackendHandle,
    pub queue: RequestQueue,
    /// Serializes lifecycle operations on this backend, in arrival order.
    pub ops: Arc<tokio::sync::Mutex<()>>,
}

impl BackendSlot {
    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            backend: self.handle.kind(),
            state: self.handle.state(),
            class: self.handle.class(),
            pause_policy: self.handle.pause_policy(),
            resident: self.handle.is_resident(),
            in_flight: self.handle.in_flight(),
            queued: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            last_error: self.handle.last_error(),
        }
    }
}

/// Point-in-time view of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub backend: BackendKind,
    pub state: BackendState,
    pub class: ConcurrencyClass,
    pub pause_policy: PausePolicy,
    pub resident: bool,
    pub in_flight: usize,
    pub queued: usize,
    pub queue_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Default)]
pub(crate) struct Registry {
    slots: HashMap<BackendKind, Arc<BackendSlot>>,
}

impl Registry {
    pub fn insert(&mut self, slot: BackendSlot) {
        self.slots.insert(slot.handle.kind(), Arc::new(slot));
    }

    pub fn get(&self, kind: BackendKind) -> Result<&Arc<BackendSlot>> {
        self.slots
            .get(&kind)
            .ok_or_else(|| Error::InvalidInput(format!("Backend {} is not enabled", kind)))
    }

    /// Slots in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackendSlot>> {
        BackendKind::all().iter().filter_map(|kind| self.slots.get(kind))
    }
}
