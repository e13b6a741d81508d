//! Per-backend worker loop: takes admitted requests one at a time, runs them
//! and archives the terminal state.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::arbiter::ResourceArbiter;
use super::registry::BackendSlot;
use super::request::{Completion, HistoryStatus, QueuedRequest, RequestStatus};
use crate::error::Error;
use crate::history::{HistoryStore, RecordDraft};

/// Process-scoped services shared by the workers and the lifecycle manager.
pub(crate) struct EngineContext {
    pub arbiter: ResourceArbiter,
    pub history: HistoryStore,
    pub summary_max_chars: usize,
}

pub(crate) async fn run_worker(slot: Arc<BackendSlot>, ctx: Arc<EngineContext>) {
    let kind = slot.handle.kind();
    info!("Worker for {} started", kind);

    while let Some(queued) = slot.queue.next().await {
        if queued.is_abandoned() {
            debug!("Skipping abandoned request {} on {}", queued.request.id, kind);
            continue;
        }
        serve(&slot, &ctx, queued).await;
    }

    info!("Worker for {} stopped", kind);
}

async fn serve(slot: &BackendSlot, ctx: &EngineContext, queued: QueuedRequest) {
    let QueuedRequest { mut request, reply } = queued;
    let kind = request.backend;
    let input_summary = request.payload.summary(ctx.summary_max_chars);

    request.status = RequestStatus::Running;
    debug!("Running request {} on {}", request.id, kind);
    let started = Instant::now();
    let result = slot.handle.invoke(request.payload, &ctx.arbiter).await;
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(output) => {
            request.status = RequestStatus::Completed;
            let draft = RecordDraft::completed(
                kind,
                request.id,
                input_summary,
                output.summary(ctx.summary_max_chars),
                duration_ms,
            );
            let history = match ctx.history.append(draft, output.artifact.clone()).await {
                Ok(stored) => HistoryStatus::Recorded(stored),
                Err(err) => {
                    warn!("Request {} on {} not recorded: {}", request.id, kind, err);
                    HistoryStatus::NotRecorded {
                        reason: err.to_string(),
                    }
                }
            };
            let completion = Completion {
                request_id: request.id,
                backend: kind,
                output,
                duration_ms,
                history,
            };
            if reply.send(Ok(completion)).is_err() {
                debug!("Caller of {} went away before completion", request.id);
            }
        }
        Err(err) => {
            request.status = match err {
                Error::BackendUnavailable { .. } => RequestStatus::Rejected,
                _ => RequestStatus::Failed,
            };
            let draft = RecordDraft::failed(kind, request.id, input_summary, duration_ms, &err);
            archive_failure(ctx, draft).await;
            let _ = reply.send(Err(err));
        }
    }

    debug!(
        "Request {} on {} ended {:?} after {:.1}ms",
        request.id, kind, request.status, duration_ms
    );
}

/// Refuse an admitted request that will never run.
pub(crate) async fn reject(ctx: &EngineContext, queued: QueuedRequest, err: Error) {
    let QueuedRequest { request, reply } = queued;
    if reply.is_closed() {
        return;
    }
    debug!("Rejecting queued request {} on {}: {}", request.id, request.backend, err);
    let draft = RecordDraft::failed(
        request.backend,
        request.id,
        request.payload.summary(ctx.summary_max_chars),
        0.0,
        &err,
    );
    archive_failure(ctx, draft).await;
    let _ = reply.send(Err(err));
}

async fn archive_failure(ctx: &EngineContext, draft: RecordDraft) {
    let request_id = draft.request_id;
    if let Err(err) = ctx.history.append(draft, None).await {
        error!("Failure of request {} not recorded: {}", request_id, err);
    }
}
