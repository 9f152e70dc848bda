//! Turns a tool's `costingModel` into a USD figure, either a pre-flight estimate (§4.F
//! step 3) or a realised amount once a run has actually finished (§4.F step 7).

use rust_decimal::Decimal;
use serde_json::Value;

use noema_model::{CostingModel, CostingUnit, Service, Tool};

/// Stable string key used both to tag a generation's `serviceName` and to look up a
/// per-service multiplier override in the pricing table (§4.B, §3 Tool.service).
pub fn service_name(service: Service) -> &'static str {
    match service {
        Service::ComfyUi => "comfyui",
        Service::Dalle => "dalle",
        Service::OpenAiChat => "openai-chat",
        Service::String => "string",
        Service::VastAiTraining => "vastai-training",
    }
}

/// Default token estimate for a pre-flight quote on a per-token tool, used only because no
/// request has been made yet to measure against. Realised settlement always uses the
/// actual token count reported in the result payload.
const DEFAULT_TOKEN_ESTIMATE: i64 = 1000;

/// Upfront estimate used for the pre-flight ledger quote (§4.F step 3). Conservative: for
/// dynamic per-second tools it assumes the tool's configured max duration runs to term.
pub fn estimate_cost_usd(tool: &Tool) -> Decimal {
    match &tool.costing_model {
        CostingModel::Static { amount } => *amount,
        CostingModel::Dynamic { rate, unit } => match unit {
            CostingUnit::Second => *rate * Decimal::from(tool.max_duration_ms()) / Decimal::from(1000),
            CostingUnit::Run => *rate,
            CostingUnit::Token => *rate * Decimal::from(DEFAULT_TOKEN_ESTIMATE),
        },
    }
}

/// Realised cost once a generation has actually finished (§4.F step 7): static tools
/// always charge the flat amount; dynamic tools are billed against the real
/// `duration_ms`, or the token count the runtime reported in its result payload, or a flat
/// per-run charge.
pub fn realized_cost_usd(tool: &Tool, duration_ms: u64, result_payload: Option<&Value>) -> Decimal {
    match &tool.costing_model {
        CostingModel::Static { amount } => *amount,
        CostingModel::Dynamic { rate, unit } => match unit {
            CostingUnit::Second => *rate * Decimal::from(duration_ms) / Decimal::from(1000),
            CostingUnit::Run => *rate,
            CostingUnit::Token => {
                let tokens = result_payload
                    .and_then(|v| v.get("usage"))
                    .and_then(|v| v.get("total_tokens"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                *rate * Decimal::from(tokens)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noema_model::{DeliveryMode, InputSchema, Service, ToolId, ToolMetadata};

    fn tool_with_model(costing_model: CostingModel) -> Tool {
        Tool {
            tool_id: ToolId::new("t1"),
            command_name: None,
            display_name: "Test".into(),
            service: Service::ComfyUi,
            delivery_mode: DeliveryMode::Async,
            input_schema: InputSchema::default(),
            costing_model,
            metadata: ToolMetadata::default(),
        }
    }

    #[test]
    fn static_cost_is_flat_regardless_of_duration() {
        let tool = tool_with_model(CostingModel::Static { amount: Decimal::new(50, 2) });
        assert_eq!(realized_cost_usd(&tool, 999_999, None), Decimal::new(50, 2));
    }

    #[test]
    fn dynamic_second_rate_scales_with_duration() {
        let tool = tool_with_model(CostingModel::Dynamic { rate: Decimal::new(10, 2), unit: CostingUnit::Second });
        assert_eq!(realized_cost_usd(&tool, 2000, None), Decimal::new(20, 2));
    }

    #[test]
    fn dynamic_token_rate_reads_usage_from_result_payload() {
        let tool = tool_with_model(CostingModel::Dynamic { rate: Decimal::new(2, 3), unit: CostingUnit::Token });
        let result = serde_json::json!({"usage": {"total_tokens": 500}});
        assert_eq!(realized_cost_usd(&tool, 0, Some(&result)), Decimal::new(2, 3) * Decimal::from(500));
    }

    #[test]
    fn estimate_uses_max_duration_for_second_rate() {
        let tool = tool_with_model(CostingModel::Dynamic { rate: Decimal::new(1, 2), unit: CostingUnit::Second });
        let expected = Decimal::new(1, 2) * Decimal::from(tool.max_duration_ms()) / Decimal::from(1000);
        assert_eq!(estimate_cost_usd(&tool), expected);
    }
}
