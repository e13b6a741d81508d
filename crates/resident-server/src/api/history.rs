//! Request history endpoints

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use resident_core::HistoryRecord;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct DatesResponse {
    pub dates: Vec<String>,
}

#[derive(Serialize)]
pub struct RecordsResponse {
    pub date: String,
    pub records: Vec<HistoryRecord>,
}

/// Dates with history, newest first
pub async fn list_dates(State(state): State<AppState>) -> Result<Json<DatesResponse>, ApiError> {
    let dates = state.orchestrator.dates().await?;
    Ok(Json(DatesResponse { dates }))
}

pub async fn list_records(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<RecordsResponse>, ApiError> {
    let records = state.orchestrator.history(&date).await?;
    Ok(Json(RecordsResponse { date, records }))
}

pub async fn get_artifact(
    State(state): State<AppState>,
    Path((date, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state.orchestrator.artifact_path(&date, &name)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ApiError::not_found(format!("Artifact {}/{}", date, name)),
            _ => ApiError::internal(format!("Failed to read artifact: {}", e)),
        })?;

    Ok(([(header::CONTENT_TYPE, content_type(&name))], bytes))
}

fn content_type(name: &str) -> &'static str {
    let extension = name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match extension.as_str() {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
