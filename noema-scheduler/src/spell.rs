//! Spell cast executor (§4.G): walks a spell's step DAG in topological order, routing each
//! step's output into the inputs of whatever it's connected to, and settles through the
//! same [`LifecycleEngine::execute`] path every other invocation goes through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;

use noema_events::BusEvent;
use noema_lifecycle::ExecuteHints;
use noema_lifecycle::LifecycleEngine;
use noema_model::{
    CastStatus, Connection, GenerationRecord, GenerationStatus, NotificationPlatform, SpellCast,
    SpellCastId, SpellStep, StepStatus, User,
};
use noema_notify::NotificationBus;
use noema_store::Store;

use crate::error::SchedulerError;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct SpellExecutor {
    store: Arc<dyn Store>,
    lifecycle: Arc<LifecycleEngine>,
    bus: Arc<NotificationBus>,
}

impl SpellExecutor {
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<LifecycleEngine>, bus: Arc<NotificationBus>) -> Self {
        Self { store, lifecycle, bus }
    }

    /// Casts `slug` with `context` as the exposed-input bindings. Runs synchronously to
    /// completion: each step is submitted, polled to a terminal state, and its output is
    /// wired into the next step's parameters before the next step is submitted.
    pub async fn cast(&self, slug: &str, context: HashMap<String, Value>, user: &User) -> Result<SpellCast, SchedulerError> {
        let spell = self.store.find_spell_by_slug(slug).await?;
        let order = spell.topological_order()?;
        let terminal_steps: std::collections::HashSet<&str> = spell.terminal_steps().into_iter().collect();

        let mut cast = self
            .store
            .create_spell_cast(SpellCast {
                cast_id: SpellCastId::generate(),
                slug: slug.to_string(),
                context: context.clone(),
                status: CastStatus::Running,
                step_status: order.iter().map(|id| (id.clone(), StepStatus::Pending)).collect(),
                step_generation_ids: HashMap::new(),
                output: None,
            })
            .await?;

        let mut outputs: HashMap<String, Value> = HashMap::new();

        for (index, step_id) in order.iter().enumerate() {
            let step = spell
                .steps
                .iter()
                .find(|s| &s.step_id == step_id)
                .expect("topological_order only returns ids present in spell.steps");

            cast.step_status.insert(step_id.clone(), StepStatus::Running);
            cast = self.store.update_spell_cast(cast).await?;

            let inputs = resolve_step_inputs(step, &spell.connections, &outputs, &context);
            let hints = ExecuteHints {
                spell_cast_id: Some(cast.cast_id.clone()),
                step_index: Some(index as u32),
                ..Default::default()
            };

            let record = match self.lifecycle.execute(&step.tool_identifier, inputs, user, NotificationPlatform::None, hints).await {
                Ok(outcome) => self.wait_for_terminal(outcome.generation_id).await?,
                Err(e) => {
                    cast.status = CastStatus::Failed;
                    cast.step_status.insert(step_id.clone(), StepStatus::Failed);
                    self.store.update_spell_cast(cast).await?;
                    return Err(e.into());
                }
            };
            cast.step_generation_ids.insert(step_id.clone(), record.id.clone());

            if record.status != GenerationStatus::Completed {
                cast.status = CastStatus::Failed;
                cast.step_status.insert(step_id.clone(), StepStatus::Failed);
                cast = self.store.update_spell_cast(cast).await?;
                return Ok(cast);
            }

            let output = record.result_payload.clone().unwrap_or(Value::Null);
            cast.step_status.insert(step_id.clone(), StepStatus::Completed);
            if terminal_steps.contains(step_id.as_str()) {
                cast.output = Some(output.clone());
            }
            outputs.insert(step_id.clone(), output.clone());
            cast = self.store.update_spell_cast(cast).await?;

            // Only terminal steps settle as `generationUpdated` inside Lifecycle (their
            // notification_platform would have to be set for that; cast steps always run
            // with None). Intermediate progress is this event instead.
            self.bus.publish(BusEvent::SpellStepCompleted {
                cast_id: cast.cast_id.as_str().to_string(),
                step_index: index as u32,
                output,
            });
        }

        cast.status = CastStatus::Completed;
        cast = self.store.update_spell_cast(cast).await?;
        Ok(cast)
    }

    async fn wait_for_terminal(&self, generation_id: noema_model::GenerationId) -> Result<GenerationRecord, SchedulerError> {
        loop {
            let record = self.store.find_generation_by_id(&generation_id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

/// Builds a step's resolved inputs: the step's own declared parameters, defaulted from the
/// cast's exposed-input context, then overridden by whatever upstream step output each
/// incoming connection routes in (§3 Spell connections: `from.output` feeds `to.input`).
fn resolve_step_inputs(
    step: &SpellStep,
    connections: &[Connection],
    outputs: &HashMap<String, Value>,
    context: &HashMap<String, Value>,
) -> Value {
    let mut params = step.parameters.as_object().cloned().unwrap_or_default();
    for (key, value) in context {
        params.entry(key.clone()).or_insert_with(|| value.clone());
    }
    for conn in connections.iter().filter(|c| c.to.step_id == step.step_id) {
        if let Some(upstream) = outputs.get(&conn.from.step_id) {
            let routed = upstream.get(&conn.from.port).cloned().unwrap_or_else(|| upstream.clone());
            params.insert(conn.to.port.clone(), routed);
        }
    }
    Value::Object(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use noema_model::Endpoint;

    #[test]
    fn resolves_plain_parameters_with_context_defaults() {
        let step = SpellStep {
            step_id: "a".into(),
            tool_identifier: "upscale".into(),
            parameters: serde_json::json!({"scale": 2}),
        };
        let resolved = resolve_step_inputs(&step, &[], &HashMap::new(), &HashMap::from([("prompt".to_string(), serde_json::json!("a cat"))]));
        assert_eq!(resolved["scale"], 2);
        assert_eq!(resolved["prompt"], "a cat");
    }

    #[test]
    fn connection_overrides_routes_upstream_output_field() {
        let step = SpellStep { step_id: "b".into(), tool_identifier: "caption".into(), parameters: serde_json::json!({}) };
        let connections = vec![Connection {
            from: Endpoint { step_id: "a".into(), port: "image".into() },
            to: Endpoint { step_id: "b".into(), port: "image".into() },
        }];
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), serde_json::json!({"image": "https://x/out.png"}));
        let resolved = resolve_step_inputs(&step, &connections, &outputs, &HashMap::new());
        assert_eq!(resolved["image"], "https://x/out.png");
    }
}
