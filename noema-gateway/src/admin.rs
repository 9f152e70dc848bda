//! Internal admin surface (§6 CLI), authenticated with `INTERNAL_API_KEY_ADMIN` rather than
//! the per-user `X-API-Key` credential. Currently just the export-worker pause switch; new
//! admin-controlled workers register their routes here the same way.

use axum::extract::State;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use noema_store::{WorkerControl, EXPORT_WORKER_NAME};

use crate::auth::check_admin_key;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/admin/export/pause", post(export_pause))
        .route("/api/v1/admin/export/resume", post(export_resume))
        .route("/api/v1/admin/export/status", get(export_status))
}

fn admin_header(parts: &Parts) -> Option<&str> {
    parts.headers.get("X-Admin-Key").and_then(|v| v.to_str().ok())
}

#[derive(Deserialize)]
struct PauseRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn export_pause(
    State(state): State<AppState>,
    parts: Parts,
    Json(body): Json<PauseRequest>,
) -> Result<Json<WorkerControl>, AppError> {
    check_admin_key(admin_header(&parts), state.admin_key.as_str())?;
    let control = WorkerControl { paused: true, reason: body.reason };
    Ok(Json(state.store.set_worker_control(EXPORT_WORKER_NAME, control).await?))
}

async fn export_resume(State(state): State<AppState>, parts: Parts) -> Result<Json<WorkerControl>, AppError> {
    check_admin_key(admin_header(&parts), state.admin_key.as_str())?;
    let control = WorkerControl { paused: false, reason: None };
    Ok(Json(state.store.set_worker_control(EXPORT_WORKER_NAME, control).await?))
}

#[derive(Serialize)]
struct StatusResponse {
    paused: bool,
    reason: Option<String>,
}

async fn export_status(State(state): State<AppState>, parts: Parts) -> Result<Json<StatusResponse>, AppError> {
    check_admin_key(admin_header(&parts), state.admin_key.as_str())?;
    let control = state.store.get_worker_control(EXPORT_WORKER_NAME).await?;
    Ok(Json(StatusResponse { paused: control.paused, reason: control.reason }))
}
