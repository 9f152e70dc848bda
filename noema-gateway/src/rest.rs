//! REST surface (§6). Each handler does the HTTP-specific bits (extraction, status codes)
//! and otherwise just calls through to the lifecycle engine, cook scheduler, or spell
//! executor — the same code paths MCP uses.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Json, Router};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use noema_lifecycle::ExecuteHints;
use noema_model::{Cook, CookConfig, GenerationId, NotificationPlatform, SpellCastId, ToolId};
use noema_store::{GenerationFilter, EXPORT_WORKER_NAME};

use crate::auth::AuthedUser;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/tools/registry", get(list_tools))
        .route("/api/v1/loras/list", get(list_loras))
        .route("/api/v1/generation/execute", post(execute_generation))
        .route("/api/v1/generation/cast", post(execute_generation))
        .route("/api/v1/generation/status/:id", get(generation_status))
        .route("/api/v1/points", get(points_balance))
        .route("/api/v1/wallets/initiate", post(wallets_initiate))
        .route("/api/v1/wallets/status/:request_id", get(wallets_status))
        .route("/api/v1/spells/cast", post(spells_cast))
        .route("/api/v1/spells/casts/:cast_id", get(spells_cast_status))
        .route("/api/v1/collections", post(collections_create))
        .route("/api/v1/collections/:id", get(collections_show))
        .route("/api/v1/collections/:id/cook/start", post(cook_start))
        .route("/api/v1/collections/:id/cook/pause", post(cook_pause))
        .route("/api/v1/collections/:id/cook/resume", post(cook_resume))
        .route("/api/v1/collections/:id/cook/stop", post(cook_stop))
        .route("/api/v1/collections/:id/review", post(cook_review))
        .route("/api/v1/collections/:id/export", get(collections_export))
        .route("/api/v1/trainings", post(trainings_submit))
        .route("/api/v1/trainings/:id", get(generation_status))
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<noema_model::Tool>> {
    Json(state.registry.list())
}

#[derive(Deserialize)]
struct LoraQuery {
    checkpoint: Option<String>,
    q: Option<String>,
    #[serde(rename = "filterType")]
    filter_type: Option<String>,
    limit: Option<usize>,
}

async fn list_loras(State(state): State<AppState>, Query(query): Query<LoraQuery>) -> Result<Json<Vec<noema_model::LoraModel>>, AppError> {
    let mut loras = state.store.list_loras().await?;
    if let Some(checkpoint) = query.checkpoint.as_deref() {
        loras.retain(|l| format!("{:?}", l.checkpoint).eq_ignore_ascii_case(checkpoint));
    }
    if let Some(q) = query.q.as_deref() {
        loras.retain(|l| l.matches_query(q));
    }
    if query.filter_type.as_deref() == Some("public") {
        loras.retain(|l| l.is_public());
    }
    if let Some(limit) = query.limit {
        loras.truncate(limit);
    }
    Ok(Json(loras))
}

#[derive(Deserialize)]
struct ExecuteRequest {
    #[serde(rename = "toolId")]
    tool_id: String,
    inputs: Value,
    #[serde(rename = "deliveryMode")]
    _delivery_mode: Option<String>,
}

#[derive(Serialize)]
struct ExecuteResponse {
    #[serde(rename = "generationId")]
    generation_id: String,
    status: String,
    result: Option<Value>,
    #[serde(rename = "pollUrl")]
    poll_url: Option<String>,
}

async fn execute_generation(State(state): State<AppState>, AuthedUser(user): AuthedUser, Json(body): Json<ExecuteRequest>) -> Result<Json<ExecuteResponse>, AppError> {
    let outcome = state
        .lifecycle
        .execute(&body.tool_id, body.inputs, &user, NotificationPlatform::None, ExecuteHints::default())
        .await?;
    Ok(Json(ExecuteResponse {
        generation_id: outcome.generation_id.as_str().to_string(),
        status: format!("{:?}", outcome.status).to_ascii_lowercase(),
        result: outcome.result,
        poll_url: outcome.poll_url,
    }))
}

async fn generation_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<noema_model::GenerationRecord>, AppError> {
    let record = state.store.find_generation_by_id(&GenerationId::new(id)).await?;
    Ok(Json(record))
}

#[derive(Serialize)]
struct PointsResponse {
    points_remaining: i64,
}

async fn points_balance(State(state): State<AppState>, AuthedUser(user): AuthedUser) -> Result<Json<PointsResponse>, AppError> {
    let points_remaining = state.store.sum_points_remaining(&user.master_account_id).await?;
    Ok(Json(PointsResponse { points_remaining }))
}

#[derive(Deserialize)]
struct WalletInitiateRequest {
    #[serde(rename = "depositToAddress")]
    deposit_to_address: String,
}

#[derive(Serialize)]
struct WalletInitiateResponse {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(rename = "magicAmount")]
    magic_amount: String,
    #[serde(rename = "depositToAddress")]
    deposit_to_address: String,
    #[serde(rename = "expiresAt")]
    expires_at: chrono::DateTime<chrono::Utc>,
}

async fn wallets_initiate(State(state): State<AppState>, Json(body): Json<WalletInitiateRequest>) -> Json<WalletInitiateResponse> {
    let initiated = state.wallet_links.initiate(body.deposit_to_address);
    Json(WalletInitiateResponse {
        request_id: initiated.request_id,
        magic_amount: initiated.magic_amount_wei.to_string(),
        deposit_to_address: initiated.deposit_to_address,
        expires_at: initiated.expires_at,
    })
}

async fn wallets_status(State(state): State<AppState>, Path(request_id): Path<String>) -> impl IntoResponse {
    use crate::wallet_link::LinkStatus;
    use axum::http::StatusCode;

    match state.wallet_links.status(&request_id) {
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": {"code": "NOT_FOUND"}}))).into_response(),
        Some((LinkStatus::Pending, _)) => (StatusCode::ACCEPTED, Json(serde_json::json!({"status": "PENDING"}))).into_response(),
        Some((LinkStatus::Completed, api_key)) => {
            (StatusCode::OK, Json(serde_json::json!({"status": "COMPLETED", "apiKey": api_key}))).into_response()
        }
        Some((LinkStatus::AlreadyClaimed, _)) => {
            (StatusCode::GONE, Json(serde_json::json!({"status": "ALREADY_CLAIMED"}))).into_response()
        }
        Some((LinkStatus::Expired, _)) => (StatusCode::OK, Json(serde_json::json!({"status": "EXPIRED"}))).into_response(),
    }
}

#[derive(Deserialize)]
struct SpellCastRequest {
    slug: String,
    #[serde(default)]
    context: HashMap<String, Value>,
}

async fn spells_cast(State(state): State<AppState>, AuthedUser(user): AuthedUser, Json(body): Json<SpellCastRequest>) -> Result<Json<noema_model::SpellCast>, AppError> {
    let cast = state.spells.cast(&body.slug, body.context, &user).await?;
    Ok(Json(cast))
}

async fn spells_cast_status(State(state): State<AppState>, Path(cast_id): Path<String>) -> Result<Json<noema_model::SpellCast>, AppError> {
    let cast = state.store.find_spell_cast(&SpellCastId::new(cast_id)).await?;
    Ok(Json(cast))
}

#[derive(Deserialize)]
struct CreateCookRequest {
    name: String,
    #[serde(rename = "toolId")]
    tool_id: String,
    #[serde(rename = "promptTemplate")]
    prompt_template: String,
    #[serde(default)]
    config: CookConfig,
    #[serde(rename = "targetCount")]
    target_count: u32,
}

async fn collections_create(State(state): State<AppState>, AuthedUser(user): AuthedUser, Json(body): Json<CreateCookRequest>) -> Result<Json<Cook>, AppError> {
    let cook = Cook::new(
        noema_model::CookId::generate(),
        body.name,
        user.master_account_id,
        ToolId::new(body.tool_id),
        body.prompt_template,
        body.config,
        body.target_count,
    );
    let created = state.cooks.create(cook).await?;
    Ok(Json(created))
}

async fn collections_show(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Cook>, AppError> {
    let cook = state.store.find_cook_by_id(&noema_model::CookId::new(id)).await?;
    Ok(Json(cook))
}

async fn cook_start(State(state): State<AppState>, Path(id): Path<String>) -> Result<(), AppError> {
    state.cooks.start(&noema_model::CookId::new(id)).await?;
    Ok(())
}

async fn cook_pause(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Cook>, AppError> {
    Ok(Json(state.cooks.pause(&noema_model::CookId::new(id)).await?))
}

async fn cook_resume(State(state): State<AppState>, Path(id): Path<String>) -> Result<(), AppError> {
    state.cooks.resume(&noema_model::CookId::new(id)).await?;
    Ok(())
}

async fn cook_stop(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Cook>, AppError> {
    Ok(Json(state.cooks.stop(&noema_model::CookId::new(id)).await?))
}

#[derive(Deserialize)]
struct ReviewRequest {
    #[serde(rename = "generationId")]
    generation_id: String,
    accept: bool,
}

async fn cook_review(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<ReviewRequest>) -> Result<Json<Cook>, AppError> {
    let cook_id = noema_model::CookId::new(id);
    let generation_id = GenerationId::new(body.generation_id);
    Ok(Json(state.cooks.review(&cook_id, &generation_id, body.accept).await?))
}

#[derive(Deserialize)]
struct TrainingRequest {
    #[serde(rename = "toolId")]
    tool_id: String,
    inputs: Value,
}

/// Trainings are plain generations against a `VastAiTraining` tool (§4.E); there is no
/// separate aggregate, so submission and polling reuse the generation endpoints.
async fn trainings_submit(State(state): State<AppState>, AuthedUser(user): AuthedUser, Json(body): Json<TrainingRequest>) -> Result<Json<ExecuteResponse>, AppError> {
    let outcome = state
        .lifecycle
        .execute(&body.tool_id, body.inputs, &user, NotificationPlatform::None, ExecuteHints::default())
        .await?;
    Ok(Json(ExecuteResponse {
        generation_id: outcome.generation_id.as_str().to_string(),
        status: format!("{:?}", outcome.status).to_ascii_lowercase(),
        result: outcome.result,
        poll_url: outcome.poll_url,
    }))
}

/// `/export` hands back the accepted pieces' generation records; the caller is expected to
/// fetch result payloads from there (no separate archive format is built here). Honors the
/// export worker's admin pause (§6 CLI: "export-worker control").
async fn collections_export(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Vec<noema_model::GenerationRecord>>, AppError> {
    let control = state.store.get_worker_control(EXPORT_WORKER_NAME).await?;
    if control.paused {
        return Err(AppError(noema_model::NoemaError::new(
            noema_model::ErrorKind::Conflict,
            format!("export worker paused: {}", control.reason.unwrap_or_default()),
        )));
    }
    let cook_id = noema_model::CookId::new(id);
    let cook = state.store.find_cook_by_id(&cook_id).await?;
    let filter = GenerationFilter { cook_execution_id: Some(cook_id), ..Default::default() };
    let generations = state.store.find_generations(filter).await?;
    Ok(Json(generations.into_iter().filter(|g| cook.accepted_ids.contains(&g.id)).collect()))
}
