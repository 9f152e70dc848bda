//! VastAI training monitor (§5 scheduling model: "one task per running training job").
//!
//! VastAI has no webhook channel, so a submitted training job only produces progress
//! through polling. This drives [`VastAiRuntime::poll`] on its own interval and feeds the
//! result through the same [`LifecycleEngine::handle_runtime_event`] path a webhook would,
//! so settlement and notification stay in one place.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use noema_lifecycle::LifecycleEngine;
use noema_model::{GenerationId, RunId};
use noema_runtimes::vastai::{ArtifactDestination, VastAiRuntime};
use noema_runtimes::NormalizedEvent;
use noema_store::{GenerationFilter, Store};

const SERVICE_NAME: &str = "vastai-training";

/// How often the discovery loop rescans the store for training generations that don't
/// have a poll loop yet (new submissions, and survivors of a prior process's crash).
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Drives every in-flight training job's poll loop. One instance is shared across the
/// process; `active` tracks which generations already have a live loop so the discovery
/// loop never double-spawns one.
pub struct TrainingMonitor {
    store: Arc<dyn Store>,
    lifecycle: Arc<LifecycleEngine>,
    runtime: Arc<VastAiRuntime>,
    active: Mutex<HashSet<GenerationId>>,
}

impl TrainingMonitor {
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<LifecycleEngine>, runtime: Arc<VastAiRuntime>) -> Arc<Self> {
        Arc::new(Self { store, lifecycle, runtime, active: Mutex::new(HashSet::new()) })
    }

    /// Scans the store once and attaches a poll loop to every non-terminal training
    /// generation that doesn't already have one (§4.G crash/restart durability, same
    /// pattern as the cook scheduler's `resume_in_flight_pieces`).
    pub async fn discover_once(self: &Arc<Self>) -> Result<(), noema_store::StoreError> {
        for generation in self.store.find_generations(GenerationFilter::default()).await? {
            if generation.service_name == SERVICE_NAME && !generation.status.is_terminal() {
                self.ensure_worker(generation.id);
            }
        }
        Ok(())
    }

    /// Spawns a background task that calls [`Self::discover_once`] forever on
    /// [`DISCOVERY_INTERVAL`] (§5: "the VastAI training monitor, one task per running
    /// training job" — this is the task that finds them).
    pub fn spawn_discovery_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = this.discover_once().await {
                    tracing::error!(error = %e, "training monitor discovery sweep failed");
                }
                tokio::time::sleep(DISCOVERY_INTERVAL).await;
            }
        });
    }

    fn ensure_worker(self: &Arc<Self>, id: GenerationId) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.insert(id.clone()) {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let finished_id = id.clone();
                this.run(id).await;
                this.active.lock().unwrap_or_else(|e| e.into_inner()).remove(&finished_id);
            });
        }
    }

    async fn run(self: Arc<Self>, generation_id: GenerationId) {
        loop {
            let generation = match self.store.find_generation_by_id(&generation_id).await {
                Ok(g) => g,
                Err(e) => {
                    tracing::error!(generation_id = %generation_id, error = %e, "training monitor lost track of generation");
                    return;
                }
            };
            if generation.status.is_terminal() {
                return;
            }
            let Some(run_id) = generation.metadata.run_id.clone() else {
                tracing::error!(generation_id = %generation_id, "training generation has no run_id to poll");
                return;
            };
            let Some((host, port)) = runtime_host_port(&generation.metadata.runtime_data) else {
                tracing::error!(generation_id = %generation_id, "training generation has no ssh_host/ssh_port to poll");
                return;
            };

            match self.runtime.poll(&run_id, &host, port).await {
                Ok(event) => {
                    if self.is_terminal_event(&event) {
                        self.finalize_and_dispatch(&run_id, &generation_id, event, &host, port).await;
                        return;
                    }
                    if let Err(e) = self.lifecycle.handle_runtime_event(event).await {
                        tracing::error!(generation_id = %generation_id, error = %e, "training monitor failed to apply progress");
                    }
                }
                Err(e) => {
                    tracing::warn!(generation_id = %generation_id, error = %e, "training poll failed, retrying next interval");
                }
            }

            tokio::time::sleep(self.runtime.poll_interval()).await;
        }
    }

    fn is_terminal_event(&self, event: &NormalizedEvent) -> bool {
        matches!(event.status, noema_runtimes::NormalizedStatus::Success | noema_runtimes::NormalizedStatus::Failed)
    }

    async fn finalize_and_dispatch(
        &self,
        run_id: &RunId,
        generation_id: &GenerationId,
        mut event: NormalizedEvent,
        host: &str,
        port: u16,
    ) {
        let succeeded = matches!(event.status, noema_runtimes::NormalizedStatus::Success);
        let destination = self.artifact_destination(generation_id).await;
        match self.runtime.finalize(run_id.as_str(), host, port, succeeded, destination).await {
            Ok(outputs) => event.outputs = outputs,
            Err(e) => {
                tracing::error!(generation_id = %generation_id, error = %e, "training artifact finalize failed");
            }
        }
        if let Err(e) = self.lifecycle.handle_runtime_event(event).await {
            tracing::error!(generation_id = %generation_id, error = %e, "training monitor failed to settle terminal event");
        }
    }

    async fn artifact_destination(&self, generation_id: &GenerationId) -> ArtifactDestination {
        match self.store.find_generation_by_id(generation_id).await {
            Ok(g) => match g.request_payload.get("destination").and_then(Value::as_str) {
                Some("huggingface") => ArtifactDestination::HuggingFace,
                _ => ArtifactDestination::R2,
            },
            Err(_) => ArtifactDestination::R2,
        }
    }
}

fn runtime_host_port(runtime_data: &Option<Value>) -> Option<(String, u16)> {
    let data = runtime_data.as_ref()?;
    let host = data.get("ssh_host")?.as_str()?.to_string();
    let port = data.get("ssh_port")?.as_u64()? as u16;
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_host_port_extracts_from_json() {
        let data = Some(serde_json::json!({"ssh_host": "1.2.3.4", "ssh_port": 2222}));
        assert_eq!(runtime_host_port(&data), Some(("1.2.3.4".to_string(), 2222)));
    }

    #[test]
    fn runtime_host_port_rejects_missing_fields() {
        assert_eq!(runtime_host_port(&None), None);
        assert_eq!(runtime_host_port(&Some(serde_json::json!({"ssh_host": "1.2.3.4"}))), None);
    }
}
