//! Uniform remote runtime interface (§4.E): `submit`, `onWebhook` (normalisation only — the
//! lifecycle engine is the only consumer that applies webhook effects), `cancel`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use noema_model::RunId;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("upstream runtime error: {0}")]
    Upstream(String),
    #[error("malformed webhook payload: {0}")]
    MalformedWebhook(String),
    #[error("runtime does not support webhooks")]
    Unsupported,
}

/// Result of `submit`: either a correlator for later webhooks, or (for synchronous
/// runtimes) the finished result right away (§4.E: DALL-E/OpenAI chat).
///
/// `run_id` always takes priority over `immediate_result` when both are set: a runtime
/// that hands back a correlator is async even if it also returns connection info
/// (VastAI returns the SSH host/port that way). `runtime_data` is opaque passthrough the
/// lifecycle engine stores on the generation for the runtime's own later use (VastAI
/// stashes `{ssh_host, ssh_port}` there for its polling loop).
#[derive(Clone, Debug)]
pub struct SubmitOutcome {
    pub run_id: Option<RunId>,
    pub immediate_result: Option<Value>,
    pub runtime_data: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedStatus {
    Queued,
    Running,
    Success,
    Failed,
}

/// A webhook payload normalised into the shape the lifecycle engine expects (§4.E
/// `onWebhook`): `{run_id, status, progress?, liveStatus?, outputs?, error?}`.
#[derive(Clone, Debug)]
pub struct NormalizedEvent {
    pub run_id: RunId,
    pub status: NormalizedStatus,
    pub progress: Option<f64>,
    pub live_status: Option<String>,
    pub outputs: Option<Value>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn submit(&self, generation: &noema_model::GenerationRecord, resolved_inputs: &Value) -> Result<SubmitOutcome, RuntimeError>;
    fn normalize_webhook(&self, payload: Value) -> Result<NormalizedEvent, RuntimeError>;
    async fn cancel(&self, run_id: &RunId) -> Result<(), RuntimeError>;
}
