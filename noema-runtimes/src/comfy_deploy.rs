//! ComfyDeploy runtime (§4.E, §6 webhooks consumed).
//!
//! Webhooks report `run_queued`/`run_progress` (progress in `[0,1]`, a `live_status` tag)
//! then one terminal `run_success`/`run_failed` event.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use noema_model::{GenerationRecord, RunId};

use crate::runtime::{NormalizedEvent, NormalizedStatus, Runtime, RuntimeError, SubmitOutcome};

pub struct ComfyDeployRuntime {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ComfyDeployRuntime {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

}

#[derive(Deserialize)]
struct ComfyWebhookPayload {
    run_id: String,
    event_type: String,
    status: Option<String>,
    progress: Option<f64>,
    live_status: Option<String>,
    outputs: Option<Value>,
    error: Option<String>,
}

#[async_trait]
impl Runtime for ComfyDeployRuntime {
    async fn submit(&self, _generation: &GenerationRecord, resolved_inputs: &Value) -> Result<SubmitOutcome, RuntimeError> {
        let response = self
            .client
            .post(format!("{}/api/run", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "inputs": resolved_inputs }))
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RuntimeError::Upstream(format!(
                "comfydeploy submit returned {}",
                response.status()
            )));
        }
        #[derive(Deserialize)]
        struct SubmitResponse {
            run_id: String,
        }
        let body: SubmitResponse = response.json().await.map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        Ok(SubmitOutcome {
            run_id: Some(RunId::new(body.run_id)),
            immediate_result: None,
            runtime_data: None,
        })
    }

    fn normalize_webhook(&self, payload: Value) -> Result<NormalizedEvent, RuntimeError> {
        let parsed: ComfyWebhookPayload =
            serde_json::from_value(payload).map_err(|e| RuntimeError::MalformedWebhook(e.to_string()))?;

        let status = match (parsed.event_type.as_str(), parsed.status.as_deref()) {
            ("run_queued", _) | (_, Some("queued")) => NormalizedStatus::Queued,
            ("run_progress", _) | (_, Some("running")) => NormalizedStatus::Running,
            ("run_success", _) | (_, Some("success")) => NormalizedStatus::Success,
            ("run_failed", _) | (_, Some("failed")) => NormalizedStatus::Failed,
            (other, _) => return Err(RuntimeError::MalformedWebhook(format!("unknown event_type {other:?}"))),
        };

        Ok(NormalizedEvent {
            run_id: RunId::new(parsed.run_id),
            status,
            progress: parsed.progress,
            live_status: parsed.live_status,
            outputs: parsed.outputs,
            error: parsed.error,
        })
    }

    async fn cancel(&self, run_id: &RunId) -> Result<(), RuntimeError> {
        let response = self
            .client
            .post(format!("{}/api/run/{}/cancel", self.base_url, run_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            tracing::warn!(run_id = %run_id, status = %response.status(), "comfydeploy cancel best-effort failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_queued_and_terminal_events() {
        let runtime = ComfyDeployRuntime::new("key", "https://comfydeploy.example");
        let queued = runtime
            .normalize_webhook(serde_json::json!({"run_id": "r1", "event_type": "run_queued"}))
            .unwrap();
        assert_eq!(queued.status, NormalizedStatus::Queued);

        let success = runtime
            .normalize_webhook(serde_json::json!({
                "run_id": "r1", "event_type": "run_success", "outputs": {"url": "https://x"}
            }))
            .unwrap();
        assert_eq!(success.status, NormalizedStatus::Success);
        assert!(success.outputs.is_some());
    }

    #[test]
    fn progress_event_carries_fraction_and_live_status() {
        let runtime = ComfyDeployRuntime::new("key", "https://comfydeploy.example");
        let progress = runtime
            .normalize_webhook(serde_json::json!({
                "run_id": "r1", "event_type": "run_progress", "progress": 0.42, "live_status": "Sampling"
            }))
            .unwrap();
        assert_eq!(progress.progress, Some(0.42));
        assert_eq!(progress.live_status.as_deref(), Some("Sampling"));
    }
}
