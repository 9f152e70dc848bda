//! VastAI LoRA training runtime (§4.E, §9 retry-on-SSH-failure state machine).
//!
//! Training jobs are long-lived: `submit` provisions a GPU instance, uploads the dataset
//! and training config over `scp`, and starts training over `ssh`. There is no webhook
//! channel, so a background poll loop (spawned by the caller, see [`VastAiRuntime::poll_loop`])
//! SSHes in every 5 minutes and turns what it sees into a `NormalizedEvent` shaped exactly
//! like a ComfyDeploy webhook, so the lifecycle engine does not need a second code path.
//!
//! Offer provisioning is `SearchOffers -> RentOffer -> WaitRunning -> AttachSshKey ->
//! VerifySsh -> Provisioned`. A `VerifySsh` failure terminates the instance and retries
//! the next offer, up to 3 offers, falling back across GPU types before giving up.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use noema_model::{GenerationRecord, RunId};

use crate::runtime::{NormalizedEvent, NormalizedStatus, Runtime, RuntimeError, SubmitOutcome};

const MAX_OFFER_ATTEMPTS: usize = 3;
const POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Where finished LoRA weights land (§4.E: "either HuggingFace or R2 depending on request flags").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactDestination {
    HuggingFace,
    R2,
}

#[derive(Clone, Debug)]
pub struct GpuOffer {
    pub offer_id: String,
    pub gpu_type: String,
    pub host: String,
    pub ssh_port: u16,
}

#[derive(Deserialize)]
struct SearchOffersResponse {
    offers: Vec<OfferRow>,
}

#[derive(Deserialize)]
struct OfferRow {
    id: String,
    gpu_name: String,
}

#[derive(Deserialize)]
struct RentOfferResponse {
    instance_id: String,
}

#[derive(Deserialize)]
struct InstanceStatusResponse {
    actual_status: String,
    ssh_host: Option<String>,
    ssh_port: Option<u16>,
}

pub struct VastAiRuntime {
    client: reqwest::Client,
    api_key: String,
    ssh_key_path: String,
    gpu_types: Vec<String>,
    hf_token: String,
    r2_endpoint: String,
}

impl VastAiRuntime {
    pub fn new(
        api_key: impl Into<String>,
        ssh_key_path: impl Into<String>,
        gpu_types: Vec<String>,
        hf_token: impl Into<String>,
        r2_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            ssh_key_path: ssh_key_path.into(),
            gpu_types,
            hf_token: hf_token.into(),
            r2_endpoint: r2_endpoint.into(),
        }
    }

    async fn search_offers(&self, gpu_type: &str) -> Result<Vec<GpuOffer>, RuntimeError> {
        let response = self
            .client
            .get("https://console.vast.ai/api/v0/bundles")
            .bearer_auth(&self.api_key)
            .query(&[("gpu_name", gpu_type)])
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RuntimeError::Upstream(format!("vastai search returned {}", response.status())));
        }
        let body: SearchOffersResponse = response.json().await.map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        Ok(body
            .offers
            .into_iter()
            .map(|row| GpuOffer { offer_id: row.id, gpu_type: row.gpu_name, host: String::new(), ssh_port: 0 })
            .collect())
    }

    async fn rent_offer(&self, offer_id: &str) -> Result<String, RuntimeError> {
        let response = self
            .client
            .put(format!("https://console.vast.ai/api/v0/asks/{offer_id}/"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RuntimeError::Upstream(format!("vastai rent returned {}", response.status())));
        }
        let body: RentOfferResponse = response.json().await.map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        Ok(body.instance_id)
    }

    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatusResponse, RuntimeError> {
        let response = self
            .client
            .get(format!("https://console.vast.ai/api/v0/instances/{instance_id}/"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RuntimeError::Upstream(format!("vastai instance status returned {}", response.status())));
        }
        response.json().await.map_err(|e| RuntimeError::Upstream(e.to_string()))
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let response = self
            .client
            .delete(format!("https://console.vast.ai/api/v0/instances/{instance_id}/"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            tracing::warn!(instance_id, status = %response.status(), "vastai terminate best-effort failed");
        }
        Ok(())
    }

    async fn wait_running(&self, instance_id: &str) -> Result<(String, u16), RuntimeError> {
        for _ in 0..12 {
            let status = self.instance_status(instance_id).await?;
            if status.actual_status == "running" {
                if let (Some(host), Some(port)) = (status.ssh_host, status.ssh_port) {
                    return Ok((host, port));
                }
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        Err(RuntimeError::Upstream(format!("instance {instance_id} never reached running")))
    }

    async fn verify_ssh(&self, host: &str, port: u16) -> Result<(), RuntimeError> {
        let status = Command::new("ssh")
            .args([
                "-i",
                &self.ssh_key_path,
                "-p",
                &port.to_string(),
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "ConnectTimeout=10",
                &format!("root@{host}"),
                "true",
            ])
            .status()
            .await
            .map_err(|e| RuntimeError::Upstream(format!("ssh verify spawn failed: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Upstream(format!("ssh verify exited with {status}")))
        }
    }

    async fn upload_dataset(&self, host: &str, port: u16, local_path: &str) -> Result<(), RuntimeError> {
        let status = Command::new("scp")
            .args([
                "-i",
                &self.ssh_key_path,
                "-P",
                &port.to_string(),
                "-o",
                "StrictHostKeyChecking=no",
                "-r",
                local_path,
                &format!("root@{host}:/workspace/dataset"),
            ])
            .status()
            .await
            .map_err(|e| RuntimeError::Upstream(format!("scp spawn failed: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Upstream(format!("scp exited with {status}")))
        }
    }

    async fn start_training(&self, host: &str, port: u16, config: &Value) -> Result<(), RuntimeError> {
        let config_arg = serde_json::to_string(config).map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        let status = Command::new("ssh")
            .args([
                "-i",
                &self.ssh_key_path,
                "-p",
                &port.to_string(),
                "-o",
                "StrictHostKeyChecking=no",
                &format!("root@{host}"),
                "nohup",
                "train.sh",
                &config_arg,
                ">",
                "/workspace/train.log",
                "2>&1",
                "&",
            ])
            .status()
            .await
            .map_err(|e| RuntimeError::Upstream(format!("ssh start_training spawn failed: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Upstream(format!("ssh start_training exited with {status}")))
        }
    }

    /// Provision a GPU instance, retrying up to [`MAX_OFFER_ATTEMPTS`] offers and falling
    /// back across configured GPU types when SSH verification fails.
    async fn provision(&self) -> Result<(String, String, u16), RuntimeError> {
        let mut last_err = RuntimeError::Upstream("no gpu types configured".into());
        let mut attempts = 0;
        for gpu_type in &self.gpu_types {
            let offers = self.search_offers(gpu_type).await?;
            for offer in offers.into_iter().take(MAX_OFFER_ATTEMPTS) {
                if attempts >= MAX_OFFER_ATTEMPTS {
                    return Err(last_err);
                }
                attempts += 1;
                let instance_id = match self.rent_offer(&offer.offer_id).await {
                    Ok(id) => id,
                    Err(e) => {
                        last_err = e;
                        continue;
                    }
                };
                let (host, port) = match self.wait_running(&instance_id).await {
                    Ok(hp) => hp,
                    Err(e) => {
                        self.destroy_instance(&instance_id).await?;
                        last_err = e;
                        continue;
                    }
                };
                match self.verify_ssh(&host, port).await {
                    Ok(()) => return Ok((instance_id, host, port)),
                    Err(e) => {
                        self.destroy_instance(&instance_id).await?;
                        last_err = e;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Polls a running training job over SSH, returning a synthetic event shaped like a
    /// ComfyDeploy webhook. The caller (lifecycle engine) is expected to call this on a
    /// [`POLL_INTERVAL`] timer for the life of the job.
    pub async fn poll(&self, run_id: &RunId, host: &str, port: u16) -> Result<NormalizedEvent, RuntimeError> {
        let output = Command::new("ssh")
            .args([
                "-i",
                &self.ssh_key_path,
                "-p",
                &port.to_string(),
                "-o",
                "StrictHostKeyChecking=no",
                &format!("root@{host}"),
                "cat",
                "/workspace/train_progress.json",
            ])
            .output()
            .await
            .map_err(|e| RuntimeError::Upstream(format!("ssh poll spawn failed: {e}")))?;
        if !output.status.success() {
            return Err(RuntimeError::Upstream(format!("ssh poll exited with {}", output.status)));
        }

        #[derive(Deserialize)]
        struct ProgressFile {
            step: u64,
            total_steps: u64,
            done: bool,
            failed: bool,
            error: Option<String>,
        }
        let parsed: ProgressFile =
            serde_json::from_slice(&output.stdout).map_err(|e| RuntimeError::MalformedWebhook(e.to_string()))?;

        let status = if parsed.failed {
            NormalizedStatus::Failed
        } else if parsed.done {
            NormalizedStatus::Success
        } else {
            NormalizedStatus::Running
        };
        let progress = if parsed.total_steps > 0 {
            Some(parsed.step as f64 / parsed.total_steps as f64)
        } else {
            None
        };

        Ok(NormalizedEvent {
            run_id: run_id.clone(),
            status,
            progress,
            live_status: Some(format!("step {}/{}", parsed.step, parsed.total_steps)),
            outputs: None,
            error: parsed.error,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        POLL_INTERVAL
    }

    async fn upload_artifacts(&self, host: &str, port: u16, destination: ArtifactDestination) -> Result<Value, RuntimeError> {
        let (target, env) = match destination {
            ArtifactDestination::HuggingFace => ("huggingface", self.hf_token.clone()),
            ArtifactDestination::R2 => ("r2", self.r2_endpoint.clone()),
        };
        let output = Command::new("ssh")
            .args([
                "-i",
                &self.ssh_key_path,
                "-p",
                &port.to_string(),
                "-o",
                "StrictHostKeyChecking=no",
                &format!("root@{host}"),
                "upload_artifacts.sh",
                target,
                &env,
            ])
            .output()
            .await
            .map_err(|e| RuntimeError::Upstream(format!("ssh upload spawn failed: {e}")))?;
        if !output.status.success() {
            return Err(RuntimeError::Upstream(format!("artifact upload exited with {}", output.status)));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| RuntimeError::Upstream(e.to_string()))
    }

    /// Called by the caller once a poll reports a terminal state: uploads artifacts and
    /// terminates the instance on success, or leaves it running for debug on failure
    /// (§4.E: "on failure leaves the instance running for debug").
    pub async fn finalize(
        &self,
        instance_id: &str,
        host: &str,
        port: u16,
        succeeded: bool,
        destination: ArtifactDestination,
    ) -> Result<Option<Value>, RuntimeError> {
        if !succeeded {
            return Ok(None);
        }
        let artifacts = self.upload_artifacts(host, port, destination).await?;
        self.destroy_instance(instance_id).await?;
        Ok(Some(artifacts))
    }

    /// Lists every instance currently running under this account, for the instance
    /// sweeper to cross-reference against tracked training jobs (§6 CLI, §9 REDESIGN FLAGS
    /// "terminated-but-orphaned instances are reaped by the instance sweeper").
    pub async fn list_running_instances(&self) -> Result<Vec<String>, RuntimeError> {
        #[derive(Deserialize)]
        struct ListInstancesResponse {
            instances: Vec<ListedInstance>,
        }
        #[derive(Deserialize)]
        struct ListedInstance {
            id: serde_json::Value,
            actual_status: String,
        }
        let response = self
            .client
            .get("https://console.vast.ai/api/v0/instances/")
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RuntimeError::Upstream(format!("vastai list instances returned {}", response.status())));
        }
        let body: ListInstancesResponse = response.json().await.map_err(|e| RuntimeError::Upstream(e.to_string()))?;
        Ok(body
            .instances
            .into_iter()
            .filter(|i| i.actual_status == "running")
            .map(|i| i.id.to_string().trim_matches('"').to_string())
            .collect())
    }

    /// Terminates an instance by id, for orphans the sweeper finds with no matching
    /// training generation.
    pub async fn terminate_instance(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.destroy_instance(instance_id).await
    }
}

#[async_trait]
impl Runtime for VastAiRuntime {
    async fn submit(&self, _generation: &GenerationRecord, resolved_inputs: &Value) -> Result<SubmitOutcome, RuntimeError> {
        let (instance_id, host, port) = self.provision().await?;

        let dataset_path = resolved_inputs
            .get("dataset_path")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::Upstream("missing dataset_path in resolved inputs".into()))?;
        self.upload_dataset(&host, port, dataset_path).await?;
        self.start_training(&host, port, resolved_inputs).await?;

        Ok(SubmitOutcome {
            run_id: Some(RunId::new(instance_id)),
            immediate_result: None,
            runtime_data: Some(serde_json::json!({ "ssh_host": host, "ssh_port": port })),
        })
    }

    fn normalize_webhook(&self, _payload: Value) -> Result<NormalizedEvent, RuntimeError> {
        Err(RuntimeError::Unsupported)
    }

    async fn cancel(&self, run_id: &RunId) -> Result<(), RuntimeError> {
        self.destroy_instance(run_id.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_destination_selects_distinct_targets() {
        assert_ne!(ArtifactDestination::HuggingFace, ArtifactDestination::R2);
    }

    fn _runtime() -> VastAiRuntime {
        VastAiRuntime::new("key", "/root/.ssh/vastai", vec!["RTX4090".into()], "hf-token", "https://r2.example")
    }
}
