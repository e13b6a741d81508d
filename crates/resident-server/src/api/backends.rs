//! Inference and lifecycle endpoints

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use base64::Engine;
use resident_core::{BackendState, BackendStatus, HealthReport, HistoryStatus, RequestId};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// Where a produced artifact can be fetched.
#[derive(Debug, Serialize)]
pub struct ArtifactInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Inline copy, only when the artifact could not be stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InferResponse {
    pub request_id: RequestId,
    pub backend: String,
    pub result: Value,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactInfo>,
    pub history: HistoryStatus,
}

#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    pub backend: String,
    pub state: BackendState,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub report: HealthReport,
}

/// Run one request on a backend and wait for its result
pub async fn infer(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<InferResponse>, ApiError> {
    let Json(payload) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let completion = state.orchestrator.handle(&backend, payload).await?;

    let artifact = completion.output.artifact.as_ref().map(|data| match &completion.history {
        HistoryStatus::Recorded(stored) => ArtifactInfo {
            name: data.suggested_name.clone(),
            url: stored
                .artifact
                .as_ref()
                .map(|name| format!("/artifacts/{}/{}", stored.date, name)),
            data_base64: None,
        },
        HistoryStatus::NotRecorded { .. } => ArtifactInfo {
            name: data.suggested_name.clone(),
            url: None,
            data_base64: Some(base64::engine::general_purpose::STANDARD.encode(&data.bytes)),
        },
    });

    Ok(Json(InferResponse {
        request_id: completion.request_id,
        backend: completion.backend.to_string(),
        result: completion.output.body,
        duration_ms: completion.duration_ms,
        artifact,
        history: completion.history,
    }))
}

pub async fn status(
    State(state): State<AppState>,
    Path(backend): Path<String>,
) -> Result<Json<BackendStatus>, ApiError> {
    Ok(Json(state.orchestrator.status(&backend)?))
}

pub async fn pause(
    State(state): State<AppState>,
    Path(backend): Path<String>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    let state = state.orchestrator.pause(&backend).await?;
    Ok(Json(LifecycleResponse { backend, state }))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(backend): Path<String>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    let state = state.orchestrator.resume(&backend).await?;
    Ok(Json(LifecycleResponse { backend, state }))
}

/// Acknowledged once the restart is under way; follow it on `/api/events`.
pub async fn restart(
    State(state): State<AppState>,
    Path(backend): Path<String>,
) -> Result<(StatusCode, Json<LifecycleResponse>), ApiError> {
    state.orchestrator.restart(&backend).await?;
    info!("Restart of {} requested", backend);
    let current = state.orchestrator.status(&backend)?.state;
    Ok((
        StatusCode::ACCEPTED,
        Json(LifecycleResponse {
            backend,
            state: current,
        }),
    ))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        report: state.orchestrator.health(),
    })
}
