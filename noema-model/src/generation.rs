//! The generation record: central state-bearing entity of the lifecycle engine (§3, §4.F).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::NoemaError;
use crate::ids::{CookId, GenerationId, MasterAccountId, RunId, SpellCastId, ToolId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    CancelledByUser,
    Timeout,
}

impl GenerationStatus {
    /// Terminal states are absorbing (§4.F): no further webhook may change status or cost.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationStatus::Completed
                | GenerationStatus::Failed
                | GenerationStatus::CancelledByUser
                | GenerationStatus::Timeout
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    None,
    Pending,
    Delivered,
    Failed,
    Skipped,
}

/// Destination tag for a delivered notification, e.g. a chat platform or `none`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPlatform {
    Telegram,
    Discord,
    Web,
    None,
}

/// Correlators threaded through by the scheduler and x402 path; none are required at
/// creation time (§3 metadata.*).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenerationMetadata {
    /// Remote-runtime correlator; primary key for webhook lookup.
    pub run_id: Option<RunId>,
    pub cost_rate: Option<Decimal>,
    pub is_spell: bool,
    pub spell_cast_id: Option<SpellCastId>,
    pub cook_execution_id: Option<CookId>,
    pub step_index: Option<u32>,
    pub x402: Option<X402Settlement>,
    /// Opaque data a runtime stashes alongside `run_id` for its own later use (VastAI
    /// keeps the SSH host/port here for its polling loop).
    pub runtime_data: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct X402Settlement {
    pub transaction: String,
    pub settled: bool,
    pub cost_usd: Decimal,
    pub payer: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: GenerationId,
    pub master_account_id: MasterAccountId,
    pub service_name: String,
    pub tool_id: ToolId,
    pub tool_display_name: String,
    pub request_payload: serde_json::Value,
    pub status: GenerationStatus,
    pub delivery_status: DeliveryStatus,
    pub notification_platform: NotificationPlatform,
    pub request_timestamp: DateTime<Utc>,
    pub response_timestamp: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub cost_usd: Option<Decimal>,
    pub points_spent: Option<i64>,
    pub progress: Option<f64>,
    pub live_status: Option<String>,
    pub metadata: GenerationMetadata,
    pub result_payload: Option<serde_json::Value>,
    pub error: Option<NoemaError>,
}

impl GenerationRecord {
    pub fn new(
        id: GenerationId,
        master_account_id: MasterAccountId,
        service_name: impl Into<String>,
        tool_id: ToolId,
        tool_display_name: impl Into<String>,
        request_payload: serde_json::Value,
        notification_platform: NotificationPlatform,
    ) -> Self {
        let delivery_status = match notification_platform {
            NotificationPlatform::None => DeliveryStatus::None,
            _ => DeliveryStatus::Pending,
        };
        Self {
            id,
            master_account_id,
            service_name: service_name.into(),
            tool_id,
            tool_display_name: tool_display_name.into(),
            request_payload,
            status: GenerationStatus::Pending,
            delivery_status,
            notification_platform,
            request_timestamp: Utc::now(),
            response_timestamp: None,
            duration_ms: None,
            cost_usd: None,
            points_spent: None,
            progress: None,
            live_status: None,
            metadata: GenerationMetadata::default(),
            result_payload: None,
            error: None,
        }
    }

    /// Whether a terminal update should be published on the bus (§4.F step 7): only once
    /// per terminal transition, only when a real destination was requested.
    pub fn should_notify(&self) -> bool {
        self.status.is_terminal()
            && self.delivery_status == DeliveryStatus::Pending
            && self.notification_platform != NotificationPlatform::None
    }

    /// Rejects an out-of-order progress webhook whose progress regresses (§4.F monotonic rule).
    pub fn accepts_progress(&self, incoming: f64) -> bool {
        !self.status.is_terminal() && self.progress.map_or(true, |current| incoming >= current)
    }

    pub fn mark_duration(&mut self) {
        if let (Some(start), Some(end)) = (Some(self.request_timestamp), self.response_timestamp)
        {
            self.duration_ms = Some((end - start).num_milliseconds().max(0) as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GenerationRecord {
        GenerationRecord::new(
            GenerationId::generate(),
            MasterAccountId::parse("a".repeat(24)).unwrap(),
            "comfyui",
            ToolId::new("tool-1"),
            "Flux Txt2Img",
            serde_json::json!({"prompt": "a cat"}),
            NotificationPlatform::Telegram,
        )
    }

    #[test]
    fn new_record_has_pending_delivery_when_platform_set() {
        let g = sample();
        assert_eq!(g.delivery_status, DeliveryStatus::Pending);
        assert!(!g.should_notify());
    }

    #[test]
    fn none_platform_skips_delivery() {
        let mut g = sample();
        g.notification_platform = NotificationPlatform::None;
        g.delivery_status = DeliveryStatus::None;
        g.status = GenerationStatus::Completed;
        assert!(!g.should_notify());
    }

    #[test]
    fn should_notify_only_on_terminal_pending_delivery() {
        let mut g = sample();
        g.status = GenerationStatus::Completed;
        assert!(g.should_notify());
        g.delivery_status = DeliveryStatus::Delivered;
        assert!(!g.should_notify());
    }

    #[test]
    fn progress_rejects_regression() {
        let mut g = sample();
        g.status = GenerationStatus::Processing;
        g.progress = Some(0.5);
        assert!(g.accepts_progress(0.6));
        assert!(!g.accepts_progress(0.4));
    }

    #[test]
    fn terminal_generation_rejects_any_further_progress() {
        let mut g = sample();
        g.status = GenerationStatus::Completed;
        g.progress = Some(1.0);
        assert!(!g.accepts_progress(1.0));
    }

    #[test]
    fn duration_computed_from_timestamps() {
        let mut g = sample();
        g.response_timestamp = Some(g.request_timestamp + chrono::Duration::milliseconds(1500));
        g.mark_duration();
        assert_eq!(g.duration_ms, Some(1500));
    }
}
