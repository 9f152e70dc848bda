//! Wire shape of the four notification bus event kinds (§4.H).
//!
//! These are plain data: the bus in `noema-notify` decides delivery, this crate only
//! fixes what goes over the wire so the lifecycle engine, scheduler, and every delivery
//! adapter agree on one shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event published on the notification bus.
///
/// `GenerationUpdated` fires exactly once per terminal transition (see the gating rule in
/// `noema-lifecycle`); `GenerationProgress` may fire zero or more times per run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    GenerationUpdated {
        generation_id: String,
        status: String,
        outputs: Option<Value>,
        cost_usd: Option<String>,
    },
    GenerationProgress {
        generation_id: String,
        status: String,
        progress: Option<f32>,
        live_status: Option<String>,
    },
    SpellStepCompleted {
        cast_id: String,
        step_index: u32,
        output: Value,
    },
    CookProgress {
        cook_id: String,
        generated_count: u32,
        target_count: u32,
        cost_usd: String,
    },
}

impl BusEvent {
    /// Stable discriminant used for subscribing to one channel and for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            BusEvent::GenerationUpdated { .. } => "generation_updated",
            BusEvent::GenerationProgress { .. } => "generation_progress",
            BusEvent::SpellStepCompleted { .. } => "spell_step_completed",
            BusEvent::CookProgress { .. } => "cook_progress",
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let e = BusEvent::CookProgress {
            cook_id: "c1".into(),
            generated_count: 3,
            target_count: 10,
            cost_usd: "0.03".into(),
        };
        assert_eq!(e.kind(), "cook_progress");
    }

    #[test]
    fn serializes_with_tag() {
        let e = BusEvent::GenerationProgress {
            generation_id: "g1".into(),
            status: "processing".into(),
            progress: Some(0.47),
            live_status: Some("Sampling".into()),
        };
        let v = e.to_value().unwrap();
        assert_eq!(v["type"], "generation_progress");
        assert_eq!(v["progress"], 0.47);
    }
}
