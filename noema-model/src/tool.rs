//! Tool catalog entries (§3 Tool, §4.D Tool Registry).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::ToolId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Service {
    ComfyUi,
    Dalle,
    OpenAiChat,
    String,
    VastAiTraining,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Immediate,
    Async,
    /// Cook pieces: no per-piece notification (§4.G worker step 2).
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostingUnit {
    Second,
    Token,
    Run,
}

/// Tool cost model: either a flat per-run amount, or a per-unit rate realised against
/// actual duration/tokens/run-count (§3 Tool, used by Lifecycle step 7).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CostingModel {
    Static { amount: rust_decimal::Decimal },
    Dynamic {
        rate: rust_decimal::Decimal,
        unit: CostingUnit,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BaseModel {
    Flux,
    Sdxl,
    #[serde(rename = "SD1.5")]
    Sd15,
    Sd3,
    Kontext,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Enum,
}

/// One declarative parameter of a tool's `inputSchema` (§4.D schema validation).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<serde_json::Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub enum_values: Option<Vec<String>>,
    pub advanced: bool,
    pub hidden: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InputSchema {
    pub fields: Vec<FieldSpec>,
    /// When true, unknown keys are retained in resolved inputs rather than dropped
    /// (§4.D: "unknown keys dropped unless the schema flags them passthrough").
    pub passthrough: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub base_model: Option<BaseModel>,
    pub comfy_deployment_id: Option<String>,
    /// Milliseconds; defaults applied by the registry when absent (§5: 60s image / 300s
    /// video / 2h training).
    pub max_duration_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tool {
    pub tool_id: ToolId,
    pub command_name: Option<String>,
    pub display_name: String,
    pub service: Service,
    pub delivery_mode: DeliveryMode,
    pub input_schema: InputSchema,
    pub costing_model: CostingModel,
    pub metadata: ToolMetadata,
}

impl Tool {
    /// Default `maxDurationMs` per §5 when the tool doesn't override it.
    pub fn default_max_duration_ms(service: Service) -> u64 {
        match service {
            Service::VastAiTraining => 2 * 60 * 60 * 1000,
            Service::ComfyUi => 300_000,
            _ => 60_000,
        }
    }

    pub fn max_duration_ms(&self) -> u64 {
        self.metadata
            .max_duration_ms
            .unwrap_or_else(|| Self::default_max_duration_ms(self.service))
    }
}

/// Resolved inputs after defaulting, coercion, and passthrough filtering (§4.D).
pub type ResolvedInputs = HashMap<String, serde_json::Value>;
