//! MCP JSON-RPC 2.0 endpoint (§4.J, §6): each method maps 1-1 onto the REST semantics in
//! `rest.rs`, just wrapped in the envelope MCP clients expect.

use axum::extract::State;
use axum::{Json, Router};
use axum::routing::post;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use noema_lifecycle::ExecuteHints;
use noema_model::{GenerationId, NotificationPlatform, SpellCastId};

use crate::auth::AuthedUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/mcp", post(handle))
}

#[derive(Deserialize)]
struct RpcRequest {
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

impl RpcResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    fn err(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code, message: message.into() }) }
    }
}

/// No user-auth for the bare JSON-RPC envelope; individual methods that need a caller
/// (`tools/call`, `spells/*`) resolve `AuthedUser` themselves from the same `X-API-Key`
/// header MCP clients are expected to forward.
async fn handle(State(state): State<AppState>, user: Option<AuthedUser>, Json(req): Json<RpcRequest>) -> Json<RpcResponse> {
    let result = dispatch(&state, &req.method, req.params, user.as_ref()).await;
    Json(match result {
        Ok(value) => RpcResponse::ok(req.id, value),
        Err(e) => RpcResponse::err(req.id, rpc_code(&e.0.kind), e.0.message),
    })
}

fn rpc_code(kind: &noema_model::ErrorKind) -> i32 {
    use noema_model::ErrorKind;
    match kind {
        ErrorKind::InvalidInput => -32602,
        ErrorKind::NotFound => -32601,
        _ => -32000,
    }
}

async fn dispatch(state: &AppState, method: &str, params: Value, user: Option<&AuthedUser>) -> Result<Value, crate::error::AppError> {
    use noema_model::{ErrorKind, NoemaError};

    match method {
        "initialize" => Ok(serde_json::json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {"name": "noema-gateway", "version": env!("CARGO_PKG_VERSION")},
            "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
        })),
        "tools/list" => Ok(serde_json::json!({ "tools": state.registry.list() })),
        "tools/call" => {
            let AuthedUser(user) = require_user(user)?;
            let tool_identifier = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let inputs = params.get("arguments").cloned().unwrap_or(Value::Null);
            let outcome = state
                .lifecycle
                .execute(tool_identifier, inputs, user, NotificationPlatform::None, ExecuteHints::default())
                .await?;
            Ok(serde_json::json!({
                "generationId": outcome.generation_id.as_str(),
                "status": format!("{:?}", outcome.status).to_ascii_lowercase(),
                "result": outcome.result,
            }))
        }
        "resources/list" => {
            let loras = state.store.list_loras().await?;
            Ok(serde_json::json!({
                "resources": loras.into_iter().map(|l| serde_json::json!({
                    "uri": format!("noema://lora/{}", l.slug),
                    "name": l.name,
                })).collect::<Vec<_>>()
            }))
        }
        "resources/read" => {
            let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
            read_resource(state, uri).await
        }
        "prompts/list" => Ok(serde_json::json!({ "prompts": [] })),
        "prompts/get" => Err(NoemaError::new(ErrorKind::NotFound, "no prompt templates registered").into()),
        "spells/cast" => {
            let AuthedUser(user) = require_user(user)?;
            let slug = params.get("slug").and_then(Value::as_str).unwrap_or_default();
            let context = params
                .get("context")
                .and_then(Value::as_object)
                .map(|m| m.clone().into_iter().collect())
                .unwrap_or_default();
            let cast = state.spells.cast(slug, context, user).await?;
            Ok(serde_json::to_value(cast).unwrap_or(Value::Null))
        }
        "collections/status" => {
            let id = params.get("id").and_then(Value::as_str).unwrap_or_default();
            let cook = state.store.find_cook_by_id(&noema_model::CookId::new(id)).await?;
            Ok(serde_json::to_value(cook).unwrap_or(Value::Null))
        }
        "trainings/status" => {
            let id = params.get("id").and_then(Value::as_str).unwrap_or_default();
            let record = state.store.find_generation_by_id(&GenerationId::new(id)).await?;
            Ok(serde_json::to_value(record).unwrap_or(Value::Null))
        }
        other => Err(NoemaError::new(ErrorKind::NotFound, format!("unknown method {other}")).into()),
    }
}

async fn read_resource(state: &AppState, uri: &str) -> Result<Value, crate::error::AppError> {
    use noema_model::{ErrorKind, NoemaError};

    let rest = uri.strip_prefix("noema://lora/").ok_or_else(|| NoemaError::new(ErrorKind::InvalidInput, "unsupported resource scheme"))?;
    if let Some(query) = rest.strip_prefix("search?") {
        let params: std::collections::HashMap<String, String> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut loras = state.store.list_loras().await?;
        if let Some(q) = params.get("q") {
            loras.retain(|l| l.matches_query(q));
        }
        if let Some(checkpoint) = params.get("checkpoint") {
            loras.retain(|l| format!("{:?}", l.checkpoint).eq_ignore_ascii_case(checkpoint));
        }
        return Ok(serde_json::json!({ "loras": loras }));
    }
    let lora = state.store.find_lora_by_slug(rest).await?;
    Ok(serde_json::to_value(lora).unwrap_or(Value::Null))
}

fn require_user(user: Option<&AuthedUser>) -> Result<&AuthedUser, crate::error::AppError> {
    user.ok_or_else(|| noema_model::NoemaError::new(noema_model::ErrorKind::Unauthorized, "missing X-API-Key header").into())
}
