/// API Request Handlers
/// Thin wrappers around the manager

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use super::AppState;
use crate::core::envelope::Envelope;
use crate::core::manager::RunOutcome;
use crate::core::volume::Volume;
use crate::error::BivacError;

type ApiResult = Result<(StatusCode, Json<Value>), StatusCode>;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Deserialize)]
pub struct BackupQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
pub struct RestoreQuery {
    #[serde(default)]
    force: bool,
    #[serde(default = "default_snapshot")]
    snapshot: String,
}

fn default_snapshot() -> String {
    "latest".to_string()
}

#[derive(Deserialize)]
pub struct ResticBody {
    cmd: Vec<String>,
}

fn status_of(e: &BivacError) -> StatusCode {
    match e {
        BivacError::VolumeNotFound(_) => StatusCode::NOT_FOUND,
        BivacError::VolumeBusy(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn outcome_response(outcome: RunOutcome) -> (StatusCode, Json<Value>) {
    match outcome {
        RunOutcome::Completed(_) => (StatusCode::OK, Json(json!({ "type": "success" }))),
        RunOutcome::Busy => (StatusCode::ACCEPTED, Json(json!({ "type": "pending" }))),
    }
}

// ============================================================================
// Status Handlers
// ============================================================================

pub async fn ping() -> Json<Value> {
    Json(json!({ "type": "pong" }))
}

pub async fn get_volumes(State(state): State<AppState>) -> Json<Vec<Volume>> {
    Json(state.manager.volumes().await)
}

pub async fn get_info(State(state): State<AppState>) -> Json<Value> {
    let info = state.manager.info().await;
    Json(json!({ "type": "success", "data": info }))
}

pub async fn get_metrics(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let body = state.manager.metrics().render().map_err(|e| {
        error!("Failed to render metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}

// ============================================================================
// Volume Handlers
// ============================================================================

pub async fn backup_volume(
    State(state): State<AppState>,
    Path(volume): Path<String>,
    Query(query): Query<BackupQuery>,
) -> ApiResult {
    let outcome = state
        .manager
        .backup(&volume, query.force)
        .await
        .map_err(|e| status_of(&e))?;
    Ok(outcome_response(outcome))
}

pub async fn restore_volume(
    State(state): State<AppState>,
    Path(volume): Path<String>,
    Query(query): Query<RestoreQuery>,
) -> ApiResult {
    let outcome = state
        .manager
        .restore(&volume, query.force, &query.snapshot)
        .await
        .map_err(|e| status_of(&e))?;
    Ok(outcome_response(outcome))
}

pub async fn run_restic(
    State(state): State<AppState>,
    Path(volume): Path<String>,
    Json(body): Json<ResticBody>,
) -> ApiResult {
    match state.manager.run_restic(&volume, &body.cmd).await {
        Ok(stdout) => Ok((StatusCode::OK, Json(json!({ "type": "success", "data": stdout })))),
        Err(BivacError::Agent(msg)) => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "type": "error", "data": msg })),
        )),
        Err(e) => Err(status_of(&e)),
    }
}

// ============================================================================
// Log Receiver
// ============================================================================

pub async fn receive_logs(
    State(state): State<AppState>,
    Path(volume): Path<String>,
    body: Bytes,
) -> ApiResult {
    let envelope = Envelope::from_receiver_body(&body).map_err(|e| {
        debug!(volume = %volume, "Invalid envelope received: {}", e);
        StatusCode::BAD_REQUEST
    })?;
    state
        .manager
        .receive_logs(&volume, envelope)
        .await
        .map_err(|e| status_of(&e))?;
    Ok((StatusCode::OK, Json(json!({ "type": "success" }))))
}
