//! ComfyDeploy webhook ingestion (§6 "Webhooks consumed"): normalises the provider payload
//! and feeds it straight into the lifecycle engine, same as any other runtime event.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use noema_model::Service;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/comfydeploy", post(comfydeploy))
}

async fn comfydeploy(State(state): State<AppState>, Json(payload): Json<Value>) -> Result<StatusCode, AppError> {
    let runtime = state
        .runtimes
        .get(Service::ComfyUi)
        .ok_or_else(|| noema_model::NoemaError::new(noema_model::ErrorKind::NotFound, "no comfydeploy runtime registered"))?;
    let event = runtime
        .normalize_webhook(payload)
        .map_err(|e| noema_model::NoemaError::new(noema_model::ErrorKind::InvalidInput, e.to_string()))?;
    state.lifecycle.handle_runtime_event(event).await?;
    Ok(StatusCode::OK)
}
