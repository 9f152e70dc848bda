//! Synchronous OpenAI-backed runtime: DALL-E image generation and chat completions
//! (§4.E: "synchronous, no webhook, delivery-mode immediate").

use async_trait::async_trait;
use serde_json::Value;

use noema_model::{GenerationRecord, RunId};

use crate::runtime::{NormalizedEvent, Runtime, RuntimeError, SubmitOutcome};

pub struct OpenAiRuntime {
    client: reqwest::Client,
    api_key: String,
}

impl OpenAiRuntime {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    async fn generate_image(&self, resolved_inputs: &Value) -> Result<Value, RuntimeError> {
        let response = self
            .client
            .post("https://api.openai.com/v1/images/generations")
            .bearer_auth(&self.api_key)
            .json(resolved_inputs)
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RuntimeError::Upstream(format!("dalle returned {}", response.status())));
        }
        response.json().await.map_err(|e| RuntimeError::Upstream(e.to_string()))
    }

    async fn chat_completion(&self, resolved_inputs: &Value) -> Result<Value, RuntimeError> {
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(resolved_inputs)
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RuntimeError::Upstream(format!("openai chat returned {}", response.status())));
        }
        response.json().await.map_err(|e| RuntimeError::Upstream(e.to_string()))
    }
}

#[async_trait]
impl Runtime for OpenAiRuntime {
    async fn submit(&self, generation: &GenerationRecord, resolved_inputs: &Value) -> Result<SubmitOutcome, RuntimeError> {
        let result = if generation.service_name.eq_ignore_ascii_case("dalle") {
            self.generate_image(resolved_inputs).await?
        } else {
            self.chat_completion(resolved_inputs).await?
        };
        Ok(SubmitOutcome {
            run_id: None,
            immediate_result: Some(result),
            runtime_data: None,
        })
    }

    fn normalize_webhook(&self, _payload: Value) -> Result<NormalizedEvent, RuntimeError> {
        Err(RuntimeError::Unsupported)
    }

    async fn cancel(&self, _run_id: &RunId) -> Result<(), RuntimeError> {
        // Synchronous calls have already returned by the time a cancel could reach them.
        Ok(())
    }
}
