//! Per-backend bounded admission queue.
//!
//! Admission never blocks: a full queue rejects with `BackendBusy` right
//! away. Admitted requests are handed to the backend's worker in FIFO order,
//! one at a time. A request can be pulled back out (cancelled) as long as the
//! worker has not taken it yet.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

use super::request::{QueuedRequest, RequestId};
use crate::backend::{BackendKind, BackendState};
use crate::error::Error;

pub struct RequestQueue {
    backend: BackendKind,
    capacity: usize,
    waiting: Mutex<Waiting>,
    notify: Notify,
}

#[derive(Default)]
struct Waiting {
    items: VecDeque<QueuedRequest>,
    closed: bool,
}

impl RequestQueue {
    pub fn new(backend: BackendKind, capacity: usize) -> Self {
        Self {
            backend,
            capacity: capacity.max(1),
            waiting: Mutex::new(Waiting::default()),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of requests admitted but not yet taken by the worker.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a request, or hand it back with the reason it was refused.
    pub(crate) fn push(
        &self,
        item: QueuedRequest,
    ) -> std::result::Result<(), (Error, QueuedRequest)> {
        let mut waiting = self.lock();
        if waiting.closed {
            return Err((
                Error::BackendUnavailable {
                    backend: self.backend,
                    state: BackendState::Unloaded,
                },
                item,
            ));
        }
        if waiting.items.len() >= self.capacity {
            return Err((
                Error::BackendBusy {
                    backend: self.backend,
                    capacity: self.capacity,
                },
                item,
            ));
        }

        debug!(
            "Queued request {} on {} (depth {}/{})",
            item.request.id,
            self.backend,
            waiting.items.len() + 1,
            self.capacity
        );
        waiting.items.push_back(item);
        drop(waiting);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next request. Returns `None` once the queue is closed.
    pub(crate) async fn next(&self) -> Option<QueuedRequest> {
        loop {
            {
                let mut waiting = self.lock();
                if let Some(item) = waiting.items.pop_front() {
                    return Some(item);
                }
                if waiting.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Remove a request that has not started yet.
    pub(crate) fn cancel(&self, id: &RequestId) -> Option<QueuedRequest> {
        let mut waiting = self.lock();
        let position = waiting.items.iter().position(|q| &q.request.id == id)?;
        let item = waiting.items.remove(position);
        debug!("Cancelled queued request {} on {}", id, self.backend);
        item
    }

    /// Take every waiting request out of the queue.
    pub(crate) fn drain(&self) -> Vec<QueuedRequest> {
        self.lock().items.drain(..).collect()
    }

    /// Stop admitting for good and return whatever was still waiting.
    pub(crate) fn close(&self) -> Vec<QueuedRequest> {
        let drained = {
            let mut waiting = self.lock();
            waiting.closed = true;
            waiting.items.drain(..).collect()
        };
        self.notify.notify_one();
        drained
    }

    fn lock(&self) -> MutexGuard<'_, Waiting> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
