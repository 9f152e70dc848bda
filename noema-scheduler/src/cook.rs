//! Cook worker loop (§4.G): one task per running cook, internally spawning
//! bounded-parallelism sub-tasks per piece.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::task::JoinSet;
use tokio::time::sleep;

use noema_events::BusEvent;
use noema_lifecycle::{ExecuteHints, LifecycleEngine};
use noema_model::{Cook, CookId, CookStatus, GenerationId, NotificationPlatform, ToolId, User};
use noema_notify::NotificationBus;
use noema_store::{GenerationFilter, Store};

use crate::error::SchedulerError;

/// How often a piece-tracking sub-task re-checks an async generation for a terminal state.
const POLL_INTERVAL: Duration = Duration::from_secs(3);
/// How often the dispatch loop wakes up with nothing to do (paused, or at `maxInflight`).
const IDLE_POLL: Duration = Duration::from_secs(2);

/// Drives every running cook's worker loop. One instance is shared across the process;
/// `active` tracks which cooks already have a live loop so `start`/`resume` and
/// [`resume_all_on_boot`] never double-spawn one.
pub struct CookScheduler {
    store: Arc<dyn Store>,
    lifecycle: Arc<LifecycleEngine>,
    bus: Arc<NotificationBus>,
    active: Mutex<HashSet<CookId>>,
}

impl CookScheduler {
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<LifecycleEngine>, bus: Arc<NotificationBus>) -> Arc<Self> {
        Arc::new(Self { store, lifecycle, bus, active: Mutex::new(HashSet::new()) })
    }

    pub async fn create(&self, cook: Cook) -> Result<Cook, SchedulerError> {
        Ok(self.store.create_cook(cook).await?)
    }

    /// `start(cookId)`: draft or paused -> running, launches the worker if none is alive.
    pub async fn start(self: &Arc<Self>, id: &CookId) -> Result<(), SchedulerError> {
        let cook = self.store.find_cook_by_id(id).await?;
        if !cook.status.startable() {
            return Err(SchedulerError::NotStartable(id.to_string()));
        }
        self.store.update_cook_status(id, CookStatus::Running).await?;
        self.ensure_worker(id.clone());
        Ok(())
    }

    /// `pause(cookId)`: the live loop notices on its next iteration and stops dispatching
    /// new pieces, but lets whatever is already in flight finish.
    pub async fn pause(&self, id: &CookId) -> Result<Cook, SchedulerError> {
        Ok(self.store.update_cook_status(id, CookStatus::Paused).await?)
    }

    /// `resume(cookId)`: same as `start`, tolerant of being called for a cook whose loop
    /// merely idled through a pause rather than one killed by a process restart.
    pub async fn resume(self: &Arc<Self>, id: &CookId) -> Result<(), SchedulerError> {
        self.store.update_cook_status(id, CookStatus::Running).await?;
        self.ensure_worker(id.clone());
        Ok(())
    }

    pub async fn stop(&self, id: &CookId) -> Result<Cook, SchedulerError> {
        Ok(self.store.update_cook_status(id, CookStatus::Stopped).await?)
    }

    pub async fn review(&self, id: &CookId, generation_id: &GenerationId, accept: bool) -> Result<Cook, SchedulerError> {
        Ok(self.store.review_cook_piece(id, generation_id, accept).await?)
    }

    /// Re-launches every cook a prior process left `running` (§4.G crash/restart
    /// durability). In-flight pieces are picked back up inside [`Self::run`] by querying
    /// generations tagged with this cook's id that haven't reached a terminal state.
    pub async fn resume_all_on_boot(self: &Arc<Self>) -> Result<(), SchedulerError> {
        for cook in self.store.list_cooks_running().await? {
            self.ensure_worker(cook.id);
        }
        Ok(())
    }

    fn ensure_worker(self: &Arc<Self>, id: CookId) {
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

    async fn run(self: Arc<Self>, id: CookId) {
        let cook = match self.store.find_cook_by_id(&id).await {
            Ok(cook) => cook,
            Err(e) => {
                tracing::error!(cook_id = %id, error = %e, "worker could not load cook, aborting");
                return;
            }
        };
        let user = match self.store.find_user_by_id(&cook.master_account_id).await {
            Ok(user) => user,
            Err(e) => {
                tracing::error!(cook_id = %id, error = %e, "worker could not load cook owner, aborting");
                return;
            }
        };

        let mut tasks = JoinSet::new();
        self.resume_in_flight_pieces(&id, &mut tasks).await;

        loop {
            let cook = match self.store.find_cook_by_id(&id).await {
                Ok(cook) => cook,
                Err(_) => break,
            };
            if cook.status.is_terminal() {
                break;
            }
            if cook.status == CookStatus::Paused {
                tokio::select! {
                    _ = sleep(IDLE_POLL) => {}
                    Some(_) = tasks.join_next() => {}
                }
                continue;
            }

            let inflight = tasks.len() as u32;
            if cook.should_dispatch(inflight) {
                let variation = cook.config.variation_for(cook.generated_count as usize).map(str::to_string);
                let prompt = render_prompt(&cook.prompt_template, variation.as_deref());
                let this = Arc::clone(&self);
                let cook_id = id.clone();
                let tool_id = cook.tool_id.clone();
                let user = user.clone();
                tasks.spawn(async move { this.dispatch_piece(cook_id, tool_id, user, prompt).await });
            } else if inflight > 0 {
                tokio::select! {
                    Some(_) = tasks.join_next() => {}
                    _ = sleep(IDLE_POLL) => {}
                }
            } else {
                sleep(IDLE_POLL).await;
            }
        }

        while tasks.join_next().await.is_some() {}
    }

    /// Finds generations tagged with this cook that never reached a terminal state before
    /// a crash, and re-attaches a tracking sub-task to each without re-submitting them
    /// (§4.G: "resumed by letting their webhooks flow normally").
    async fn resume_in_flight_pieces(&self, id: &CookId, tasks: &mut JoinSet<()>) {
        let filter = GenerationFilter { cook_execution_id: Some(id.clone()), ..Default::default() };
        let Ok(generations) = self.store.find_generations(filter).await else { return };
        for generation in generations.into_iter().filter(|g| !g.status.is_terminal()) {
            let store = self.store.clone();
            let bus = self.bus.clone();
            let cook_id = id.clone();
            tasks.spawn(async move { track_piece(store, bus, cook_id, generation.id).await });
        }
    }

    async fn dispatch_piece(&self, cook_id: CookId, tool_id: ToolId, user: User, prompt: String) {
        let inputs = serde_json::json!({ "prompt": prompt });
        let hints = ExecuteHints { cook_execution_id: Some(cook_id.clone()), ..Default::default() };
        match self.lifecycle.execute(tool_id.as_str(), inputs, &user, NotificationPlatform::None, hints).await {
            Ok(outcome) => track_piece(self.store.clone(), self.bus.clone(), cook_id, outcome.generation_id).await,
            Err(e) => {
                // No generation record exists to track (the pre-flight quote rejected the
                // piece, or the tool no longer resolves). Retrying would just fail the same
                // way forever, so the cook itself is failed rather than spinning.
                tracing::error!(cook_id = %cook_id, error = %e, "cook piece rejected before dispatch, failing cook");
                let _ = self.store.update_cook_status(&cook_id, CookStatus::Failed).await;
            }
        }
    }
}

/// Waits for one piece's generation to reach a terminal state, then records it on the
/// cook aggregate and publishes `cookProgress` (§4.G worker step 3). Successes and
/// failures both leave the piece in the implicit pending-review set: `record_piece` is
/// always called with `accepted = None`, since review is a separate, explicit human action.
async fn track_piece(store: Arc<dyn Store>, bus: Arc<NotificationBus>, cook_id: CookId, generation_id: GenerationId) {
    loop {
        let generation = match store.find_generation_by_id(&generation_id).await {
            Ok(g) => g,
            Err(e) => {
                tracing::error!(cook_id = %cook_id, generation_id = %generation_id, error = %e, "lost track of cook piece");
                return;
            }
        };
        if !generation.status.is_terminal() {
            sleep(POLL_INTERVAL).await;
            continue;
        }
        let cost = generation.cost_usd.unwrap_or(Decimal::ZERO);
        match store.record_cook_piece(&cook_id, generation.id.clone(), cost, None).await {
            Ok(updated) => bus.publish(BusEvent::CookProgress {
                cook_id: cook_id.as_str().to_string(),
                generated_count: updated.generated_count,
                target_count: updated.target_count,
                cost_usd: updated.cost_usd.to_string(),
            }),
            Err(e) => tracing::error!(cook_id = %cook_id, error = %e, "failed to record cook piece"),
        }
        return;
    }
}

fn render_prompt(template: &str, variation: Option<&str>) -> String {
    match variation {
        Some(v) => template.replace("{variation}", v),
        None => template.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prompt_substitutes_variation() {
        assert_eq!(render_prompt("a photo of {variation}", Some("cat")), "a photo of cat");
    }

    #[test]
    fn render_prompt_without_variation_is_unchanged() {
        assert_eq!(render_prompt("a fixed prompt", None), "a fixed prompt");
    }
}
