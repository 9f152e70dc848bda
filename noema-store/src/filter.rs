//! Query and patch types for the generations table (§4.A `findMany`, `update`).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use noema_model::{
    CookId, DeliveryStatus, GenerationStatus, MasterAccountId, NotificationPlatform, RunId,
    SpellCastId, X402Settlement,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenerationFilter {
    pub master_account_id: Option<MasterAccountId>,
    pub status: Option<GenerationStatus>,
    pub cook_execution_id: Option<CookId>,
    pub spell_cast_id: Option<SpellCastId>,
    pub limit: Option<usize>,
}

/// Sparse update applied to a generation record; `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct GenerationPatch {
    pub status: Option<GenerationStatus>,
    pub delivery_status: Option<DeliveryStatus>,
    pub notification_platform: Option<NotificationPlatform>,
    pub run_id_set: bool,
    pub run_id: Option<RunId>,
    pub progress: Option<f64>,
    pub live_status: Option<String>,
    pub response_timestamp: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub cost_usd: Option<Decimal>,
    pub points_spent: Option<i64>,
    pub result_payload: Option<serde_json::Value>,
    pub error: Option<noema_model::NoemaError>,
    /// Attached once a generation is settled through the x402 path (§4.I step 4).
    pub x402: Option<X402Settlement>,
    /// Set alongside `run_id` for runtimes that stash connection info for later polling.
    pub runtime_data: Option<serde_json::Value>,
}

impl GenerationPatch {
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id_set = true;
        self.run_id = Some(run_id);
        self
    }
}

/// Persisted pause state for an admin-controlled background worker (§6 CLI: "export-worker
/// control"), keyed by worker name so the same mechanism covers future workers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkerControl {
    pub paused: bool,
    pub reason: Option<String>,
}

/// Worker name for the collection-export admin control, shared between the gateway's
/// `/export` route and the CLI's `export` subcommand.
pub const EXPORT_WORKER_NAME: &str = "export";
