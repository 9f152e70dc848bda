//! Batch job aggregate driven by the scheduler's worker loop (§3 Cook, §4.G).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{CookId, GenerationId, MasterAccountId, ToolId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CookStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
}

impl CookStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CookStatus::Completed | CookStatus::Stopped | CookStatus::Failed)
    }

    /// `start(cookId)` requires the cook to be in one of these states (§4.G).
    pub fn startable(&self) -> bool {
        matches!(self, CookStatus::Draft | CookStatus::Paused)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CookConfig {
    pub dimensions: Vec<String>,
    pub variations: Vec<String>,
}

impl CookConfig {
    /// Round-robins through `variations` for piece `index` (§4.G worker loop step 1).
    pub fn variation_for(&self, index: usize) -> Option<&str> {
        if self.variations.is_empty() {
            return None;
        }
        Some(&self.variations[index % self.variations.len()])
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cook {
    pub id: CookId,
    pub name: String,
    pub master_account_id: MasterAccountId,
    pub tool_id: ToolId,
    pub prompt_template: String,
    pub config: CookConfig,
    pub target_count: u32,
    pub generated_count: u32,
    pub generation_ids: Vec<GenerationId>,
    pub accepted_ids: Vec<GenerationId>,
    pub rejected_ids: Vec<GenerationId>,
    pub cost_usd: Decimal,
    pub status: CookStatus,
    pub max_inflight: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Cook {
    pub fn new(
        id: CookId,
        name: impl Into<String>,
        master_account_id: MasterAccountId,
        tool_id: ToolId,
        prompt_template: impl Into<String>,
        config: CookConfig,
        target_count: u32,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            master_account_id,
            tool_id,
            prompt_template: prompt_template.into(),
            config,
            target_count,
            generated_count: 0,
            generation_ids: Vec::new(),
            accepted_ids: Vec::new(),
            rejected_ids: Vec::new(),
            cost_usd: Decimal::ZERO,
            status: CookStatus::Draft,
            max_inflight: 2,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Whether the worker loop should start another piece (§4.G: "while status=running AND
    /// generatedCount < targetCount AND inflight < maxInflight").
    pub fn should_dispatch(&self, inflight: u32) -> bool {
        self.status == CookStatus::Running
            && self.generated_count < self.target_count
            && inflight < self.max_inflight
    }

    /// Records a finished piece: append id, bump count, accrue cost (§4.G step 3). Caller
    /// passes `accepted = None` for a failed piece (neither accepted nor rejected yet).
    pub fn record_piece(&mut self, generation_id: GenerationId, cost: Decimal, accepted: Option<bool>) {
        self.generation_ids.push(generation_id.clone());
        self.generated_count += 1;
        self.cost_usd += cost;
        match accepted {
            Some(true) => self.accepted_ids.push(generation_id),
            Some(false) => self.rejected_ids.push(generation_id),
            None => {}
        }
        if self.generated_count >= self.target_count {
            self.status = CookStatus::Completed;
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn review(&mut self, generation_id: &GenerationId, accept: bool) {
        self.accepted_ids.retain(|id| id != generation_id);
        self.rejected_ids.retain(|id| id != generation_id);
        if accept {
            self.accepted_ids.push(generation_id.clone());
        } else {
            self.rejected_ids.push(generation_id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Cook {
        Cook::new(
            CookId::generate(),
            "batch-1",
            MasterAccountId::parse("a".repeat(24)).unwrap(),
            ToolId::new("tool-1"),
            "a photo of {variation}",
            CookConfig {
                dimensions: vec![],
                variations: vec!["cat".into(), "dog".into()],
            },
            4,
        )
    }

    #[test]
    fn variation_round_robins() {
        let cook = sample();
        assert_eq!(cook.config.variation_for(0), Some("cat"));
        assert_eq!(cook.config.variation_for(1), Some("dog"));
        assert_eq!(cook.config.variation_for(2), Some("cat"));
    }

    #[test]
    fn dispatch_respects_target_and_inflight() {
        let mut cook = sample();
        cook.status = CookStatus::Running;
        assert!(cook.should_dispatch(0));
        assert!(!cook.should_dispatch(2));
        cook.generated_count = 4;
        assert!(!cook.should_dispatch(0));
    }

    #[test]
    fn record_piece_completes_at_target() {
        let mut cook = sample();
        cook.status = CookStatus::Running;
        for _ in 0..4 {
            cook.record_piece(GenerationId::generate(), Decimal::new(10, 2), Some(true));
        }
        assert_eq!(cook.status, CookStatus::Completed);
        assert!(cook.completed_at.is_some());
        assert_eq!(cook.accepted_ids.len(), 4);
    }

    #[test]
    fn review_moves_between_lists() {
        let mut cook = sample();
        let gid = GenerationId::generate();
        cook.review(&gid, true);
        assert!(cook.accepted_ids.contains(&gid));
        cook.review(&gid, false);
        assert!(!cook.accepted_ids.contains(&gid));
        assert!(cook.rejected_ids.contains(&gid));
    }
}
