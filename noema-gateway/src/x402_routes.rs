//! `/api/v1/x402/*` (§4.I, §6): the 402-challenge / signed-payment dance, layered over
//! `noema-x402` rather than duplicating any of its logic here.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use noema_model::GenerationId;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/x402/tools", get(list_tools))
        .route("/api/v1/x402/quote/:tool_identifier", get(quote))
        .route("/api/v1/x402/generate/:tool_identifier", post(generate))
        .route("/api/v1/x402/status/:id", get(status))
}

async fn list_tools(State(state): State<AppState>) -> axum::Json<Vec<noema_model::Tool>> {
    axum::Json(state.registry.list())
}

async fn quote(State(state): State<AppState>, Path(tool_identifier): Path<String>) -> Result<Json<noema_x402::X402Challenge>, AppError> {
    Ok(Json(state.x402.challenge(&tool_identifier)?))
}

#[derive(Deserialize)]
struct GenerateRequest {
    inputs: Value,
    #[serde(rename = "payerAddress")]
    payer_address: String,
}

/// No `X-PAYMENT` header: responds 402 with the challenge in `X-PAYMENT-REQUIRED`. With a
/// header: verifies and runs the tool (§4.I steps 1-3).
async fn generate(
    State(state): State<AppState>,
    Path(tool_identifier): Path<String>,
    headers: HeaderMap,
    Json(body): Json<GenerateRequest>,
) -> Result<Response, AppError> {
    let Some(payment_header) = headers.get("X-PAYMENT").and_then(|v| v.to_str().ok()) else {
        let challenge = state.x402.challenge(&tool_identifier)?;
        let mut response = (StatusCode::PAYMENT_REQUIRED, Json(serde_json::json!({"accepts": challenge.accepts}))).into_response();
        if let Ok(json) = serde_json::to_string(&challenge) {
            if let Ok(value) = axum::http::HeaderValue::from_str(&json) {
                response.headers_mut().insert("X-PAYMENT-REQUIRED", value);
            }
        }
        return Ok(response);
    };

    let payment: noema_x402::PaymentPayload = serde_json::from_str(payment_header)
        .map_err(|e| noema_model::NoemaError::new(noema_model::ErrorKind::InvalidInput, format!("malformed X-PAYMENT header: {e}")))?;

    let outcome = state.x402.pay_and_execute(&tool_identifier, body.inputs, &body.payer_address, payment).await?;
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "generationId": outcome.generation_id.as_str(),
            "status": format!("{:?}", outcome.status).to_ascii_lowercase(),
            "result": outcome.result,
        })),
    )
        .into_response())
}

async fn status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<noema_model::GenerationRecord>, AppError> {
    Ok(Json(state.store.find_generation_by_id(&GenerationId::new(id)).await?))
}
