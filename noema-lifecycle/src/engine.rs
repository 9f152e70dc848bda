//! The central state machine (§4.F): owns the generation record, processes webhooks, and
//! on terminal status runs cost settlement and emits delivery events.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::Value;

use noema_events::BusEvent;
use noema_model::{
    CookId, GenerationId, GenerationRecord, GenerationStatus, NoemaError, NotificationPlatform,
    SpellCastId, User,
};
use noema_notify::NotificationBus;
use noema_pricing::PricingTable;
use noema_registry::ToolRegistry;
use noema_runtimes::{NormalizedEvent, NormalizedStatus, SubmitOutcome};
use noema_store::{GenerationPatch, Store};

use crate::cost::{estimate_cost_usd, realized_cost_usd};
use crate::error::LifecycleError;
use crate::runtimes::RuntimeTable;

/// Correlators an `execute` caller may stamp onto the generation record; all default to
/// "not part of a cook or spell" (§4.F step 4, §4.G worker step 2, §4.G spell cast).
#[derive(Clone, Debug, Default)]
pub struct ExecuteHints {
    pub cook_execution_id: Option<CookId>,
    pub spell_cast_id: Option<SpellCastId>,
    pub step_index: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ExecuteOutcome {
    pub generation_id: GenerationId,
    pub status: GenerationStatus,
    pub result: Option<Value>,
    pub poll_url: Option<String>,
}

pub struct LifecycleEngine {
    store: Arc<dyn Store>,
    registry: Arc<ToolRegistry>,
    runtimes: RuntimeTable,
    bus: Arc<NotificationBus>,
    pricing_table: RwLock<PricingTable>,
    ms2_token_address: String,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ToolRegistry>,
        runtimes: RuntimeTable,
        bus: Arc<NotificationBus>,
        pricing_table: PricingTable,
        ms2_token_address: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            runtimes,
            bus,
            pricing_table: RwLock::new(pricing_table),
            ms2_token_address: ms2_token_address.into(),
        }
    }

    /// Swaps in a new, immutable pricing table snapshot (§4.B: "never mutate in place").
    /// Generations already stamped with the old `configVersion` are unaffected.
    pub fn replace_pricing_table(&self, table: PricingTable) {
        *self.pricing_table.write().unwrap_or_else(|e| e.into_inner()) = table;
    }

    fn pricing_table_snapshot(&self) -> PricingTable {
        self.pricing_table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn resolve_tier(&self, user: &User) -> Result<noema_model::UserTier, LifecycleError> {
        if user.master_account_id.is_x402() {
            return Ok(noema_model::UserTier::Standard);
        }
        let holds_ms2 = noema_ledger::holds_confirmed_token(&*self.store, &user.master_account_id, &self.ms2_token_address).await?;
        Ok(if holds_ms2 { noema_model::UserTier::Ms2 } else { noema_model::UserTier::Standard })
    }

    /// Resolves a tool and prices it at standard tier without creating a generation
    /// (§4.I step 1: the x402 challenge needs an amount before any payer is known).
    pub fn quote_for_tool(&self, tool_identifier: &str) -> Result<(noema_model::Tool, noema_pricing::Quote), LifecycleError> {
        let tool = self
            .registry
            .resolve(tool_identifier)
            .ok_or_else(|| LifecycleError::ToolNotFound(tool_identifier.to_string()))?;
        let estimate = estimate_cost_usd(&tool);
        let table = self.pricing_table_snapshot();
        let pricing_quote = noema_pricing::quote(&table, crate::cost::service_name(tool.service), noema_model::UserTier::Standard, estimate);
        Ok((tool, pricing_quote))
    }

    /// `execute(toolId, inputs, user, deliveryHints) -> {generationId, status, result?, pollUrl?}`
    /// (§4.F).
    pub async fn execute(
        &self,
        tool_identifier: &str,
        inputs: Value,
        user: &User,
        notification_platform: NotificationPlatform,
        hints: ExecuteHints,
    ) -> Result<ExecuteOutcome, LifecycleError> {
        // 1. Resolve tool via Registry.
        let tool = self
            .registry
            .resolve(tool_identifier)
            .ok_or_else(|| LifecycleError::ToolNotFound(tool_identifier.to_string()))?;

        let resolved_inputs = noema_registry::validate(&tool.input_schema, &inputs)
            .map_err(|errors| {
                let joined = errors.into_iter().map(|e| format!("{}: {}", e.field, e.reason)).collect::<Vec<_>>().join("; ");
                LifecycleError::InvalidInput(joined)
            })?;

        // 2. Determine user tier.
        let tier = self.resolve_tier(user).await?;

        // 3. Quote points against ledger.
        let table = self.pricing_table_snapshot();
        let estimate = estimate_cost_usd(&tool);
        let pricing_quote = noema_pricing::quote(&table, crate::cost::service_name(tool.service), tier, estimate);
        if !user.master_account_id.is_x402() && !noema_ledger::quote(&*self.store, user, pricing_quote.total_points).await? {
            return Err(LifecycleError::InsufficientFunds { needed: pricing_quote.total_points });
        }

        // 4. Create generation record in `pending`.
        let mut generation = GenerationRecord::new(
            GenerationId::generate(),
            user.master_account_id.clone(),
            crate::cost::service_name(tool.service),
            tool.tool_id.clone(),
            tool.display_name.clone(),
            Value::Object(resolved_inputs.clone().into_iter().collect()),
            notification_platform,
        );
        generation.metadata.cook_execution_id = hints.cook_execution_id;
        generation.metadata.spell_cast_id = hints.spell_cast_id;
        generation.metadata.step_index = hints.step_index;
        let generation = self.store.create_generation(generation).await?;

        // 5. Invoke runtime submit.
        let runtime = self.runtimes.get(tool.service).ok_or(LifecycleError::UnsupportedService(tool.service))?;
        let resolved_value = Value::Object(resolved_inputs.into_iter().collect());
        let outcome = match runtime.submit(&generation, &resolved_value).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let failed = self
                    .store
                    .update_generation(
                        &generation.id,
                        GenerationPatch {
                            status: Some(GenerationStatus::Failed),
                            response_timestamp: Some(Utc::now()),
                            error: Some(NoemaError::new(noema_model::ErrorKind::UpstreamFailed, e.to_string())),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(ExecuteOutcome { generation_id: failed.id, status: failed.status, result: None, poll_url: None });
            }
        };

        match outcome {
            SubmitOutcome { run_id: Some(run_id), runtime_data, .. } => {
                // A correlator means this runtime is async even if it also handed back
                // connection info (VastAI's SSH host/port) alongside it.
                let mut patch = GenerationPatch::default().with_run_id(run_id);
                patch.runtime_data = runtime_data;
                let patched = self.store.update_generation(&generation.id, patch).await?;
                Ok(ExecuteOutcome {
                    generation_id: patched.id.clone(),
                    status: patched.status,
                    result: None,
                    poll_url: Some(format!("/api/v1/generations/{}", patched.id)),
                })
            }
            SubmitOutcome { immediate_result: Some(result), .. } => {
                // Synchronous runtime: jump straight to terminal settlement (§4.F step 5).
                let settled = self
                    .settle_terminal(&generation, GenerationStatus::Completed, Some(result.clone()), None)
                    .await?;
                Ok(ExecuteOutcome { generation_id: settled.id, status: settled.status, result: Some(result), poll_url: None })
            }
            SubmitOutcome { run_id: None, immediate_result: None, .. } => Ok(ExecuteOutcome {
                generation_id: generation.id.clone(),
                status: generation.status,
                result: None,
                poll_url: Some(format!("/api/v1/generations/{}", generation.id)),
            }),
        }
    }

    /// Processes one normalised runtime event (§4.F: webhooks drive everything past
    /// `pending`). Terminal-state generations absorb and discard further events.
    pub async fn handle_runtime_event(&self, event: NormalizedEvent) -> Result<(), LifecycleError> {
        let generation = match self.store.find_generation_by_run_id(&event.run_id).await {
            Ok(g) => g,
            Err(noema_store::StoreError::NotFound(_)) => {
                tracing::warn!(run_id = %event.run_id, "webhook for unknown run_id, discarding");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if generation.status.is_terminal() {
            tracing::info!(generation_id = %generation.id, "webhook for terminal generation, discarding");
            return Ok(());
        }

        match event.status {
            NormalizedStatus::Queued | NormalizedStatus::Running => {
                self.apply_progress(&generation, &event).await
            }
            NormalizedStatus::Success => {
                self.settle_terminal(&generation, GenerationStatus::Completed, event.outputs, None).await.map(|_| ())
            }
            NormalizedStatus::Failed => {
                let error = NoemaError::new(noema_model::ErrorKind::UpstreamFailed, event.error.unwrap_or_default());
                self.settle_terminal(&generation, GenerationStatus::Failed, None, Some(error)).await.map(|_| ())
            }
        }
    }

    async fn apply_progress(&self, generation: &GenerationRecord, event: &NormalizedEvent) -> Result<(), LifecycleError> {
        if let Some(progress) = event.progress {
            if !generation.accepts_progress(progress) {
                tracing::debug!(generation_id = %generation.id, "ignoring out-of-order progress webhook");
                return Ok(());
            }
        }
        let status = match event.status {
            NormalizedStatus::Queued => GenerationStatus::Queued,
            _ => GenerationStatus::Processing,
        };
        self.store
            .update_generation(
                &generation.id,
                GenerationPatch {
                    status: Some(status),
                    progress: event.progress,
                    live_status: event.live_status.clone(),
                    ..Default::default()
                },
            )
            .await?;
        self.bus.publish(BusEvent::GenerationProgress {
            generation_id: generation.id.as_str().to_string(),
            status: status_str(status).to_string(),
            progress: event.progress.map(|p| p as f32),
            live_status: event.live_status.clone(),
        });
        Ok(())
    }

    /// Terminal settlement (§4.F step 7): compute the realised cost, debit the ledger
    /// (skipped entirely for x402 callers, §4.I), patch the record, and emit
    /// `generationUpdated` if the gating rule in [`GenerationRecord::should_notify`] holds.
    async fn settle_terminal(
        &self,
        generation: &GenerationRecord,
        status: GenerationStatus,
        result_payload: Option<Value>,
        error: Option<NoemaError>,
    ) -> Result<GenerationRecord, LifecycleError> {
        let tool = self.registry.get(&generation.tool_id).ok_or_else(|| LifecycleError::ToolNotFound(generation.tool_id.to_string()))?;
        let now = Utc::now();
        let duration_ms = (now - generation.request_timestamp).num_milliseconds().max(0) as u64;
        let cost_usd = realized_cost_usd(&tool, duration_ms, result_payload.as_ref());

        let tier = if generation.master_account_id.is_x402() {
            noema_model::UserTier::Standard
        } else {
            let user = self.store.find_user_by_id(&generation.master_account_id).await?;
            self.resolve_tier(&user).await?
        };
        let table = self.pricing_table_snapshot();
        let pricing_quote = noema_pricing::quote(&table, crate::cost::service_name(tool.service), tier, cost_usd);

        let patch = GenerationPatch {
            status: Some(status),
            response_timestamp: Some(now),
            duration_ms: Some(duration_ms),
            cost_usd: Some(pricing_quote.final_cost_usd),
            points_spent: Some(pricing_quote.total_points),
            result_payload,
            error,
            ..Default::default()
        };

        let settled = if generation.master_account_id.is_x402() {
            // Ledger is never touched for x402 callers; cost accounting lives in the
            // facilitator's settled transaction (§4.I).
            self.store.update_generation(&generation.id, patch).await?
        } else {
            let user = self.store.find_user_by_id(&generation.master_account_id).await?;
            match noema_ledger::spend(&*self.store, &user, &generation.id, pricing_quote.total_points, patch.clone()).await {
                Ok((_, record)) => record,
                Err(noema_ledger::LedgerError::InsufficientFunds { .. }) => {
                    // Should be impossible given the pre-flight quote, but two concurrent
                    // jobs can race past it. The user already has the output; mark
                    // completed regardless and record the shortfall for reconciliation
                    // (§4.F cost-settlement-failure handling).
                    let forced = self
                        .store
                        .update_generation(
                            &generation.id,
                            GenerationPatch { status: Some(GenerationStatus::Completed), ..patch },
                        )
                        .await?;
                    self.store
                        .record_ledger_deficit(&generation.master_account_id, &generation.id, pricing_quote.total_points)
                        .await?;
                    forced
                }
                Err(noema_ledger::LedgerError::Storage(e)) => {
                    // Rolled back; left non-terminal so a webhook replay retries settlement.
                    // A stale-pending sweep (§4.F timeout handling) finalises it as
                    // `COST_SETTLEMENT_FAILED` if no replay ever arrives.
                    return Err(LifecycleError::CostSettlementFailed(e.to_string()));
                }
            }
        };

        if settled.should_notify() {
            // The notify worker updates `deliveryStatus` to `delivered`/`failed` once its
            // adapter acknowledges; this call only publishes, it never touches the record.
            self.bus.publish(BusEvent::GenerationUpdated {
                generation_id: settled.id.as_str().to_string(),
                status: status_str(settled.status).to_string(),
                outputs: settled.result_payload.clone(),
                cost_usd: settled.cost_usd.map(|c| c.to_string()),
            });
        }

        Ok(settled)
    }

    /// User-initiated cancellation: settles at whatever cost has accrued so far, then asks
    /// the runtime to stop the remote job (best-effort; the runtime may already be done).
    pub async fn cancel(&self, generation_id: &GenerationId) -> Result<GenerationRecord, LifecycleError> {
        let generation = self.store.find_generation_by_id(generation_id).await?;
        if generation.status.is_terminal() {
            return Ok(generation);
        }
        let tool = self.registry.get(&generation.tool_id).ok_or_else(|| LifecycleError::ToolNotFound(generation.tool_id.to_string()))?;
        if let (Some(run_id), Some(runtime)) = (generation.metadata.run_id.clone(), self.runtimes.get(tool.service)) {
            let _ = runtime.cancel(&run_id).await;
        }
        self.settle_terminal(&generation, GenerationStatus::CancelledByUser, None, None).await
    }

    /// Sweeps generations whose tool's `maxDurationMs` has elapsed without reaching a
    /// terminal state (§4.F timeout handling; also the place stale settlement failures
    /// are finally resolved, see `settle_terminal`'s `Storage` branch).
    pub async fn sweep_timeouts(&self) -> Result<Vec<GenerationId>, LifecycleError> {
        let mut timed_out = Vec::new();
        for status in [GenerationStatus::Pending, GenerationStatus::Queued, GenerationStatus::Processing] {
            let candidates = self
                .store
                .find_generations(noema_store::GenerationFilter { status: Some(status), ..Default::default() })
                .await?;
            for generation in candidates {
                let Some(tool) = self.registry.get(&generation.tool_id) else { continue };
                let elapsed = (Utc::now() - generation.request_timestamp).num_milliseconds().max(0) as u64;
                if elapsed > tool.max_duration_ms() {
                    let settled = self.settle_terminal(&generation, GenerationStatus::Timeout, None, None).await?;
                    timed_out.push(settled.id);
                }
            }
        }
        Ok(timed_out)
    }

    pub fn bus(&self) -> Arc<NotificationBus> {
        self.bus.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }
}

fn status_str(status: GenerationStatus) -> &'static str {
    match status {
        GenerationStatus::Pending => "pending",
        GenerationStatus::Queued => "queued",
        GenerationStatus::Processing => "processing",
        GenerationStatus::Completed => "completed",
        GenerationStatus::Failed => "failed",
        GenerationStatus::CancelledByUser => "cancelled_by_user",
        GenerationStatus::Timeout => "timeout",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use noema_model::{
        CostingModel, DeliveryMode, InputSchema, NotificationPlatform, Platform, Service, Tool,
        ToolMetadata,
    };
    use noema_runtimes::{Runtime, RuntimeError};
    use noema_store::InMemoryStore;
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    /// Synchronous test double: always succeeds immediately with a fixed payload.
    struct ImmediateRuntime;

    #[async_trait]
    impl Runtime for ImmediateRuntime {
        async fn submit(&self, _g: &GenerationRecord, _inputs: &Value) -> Result<SubmitOutcome, RuntimeError> {
            Ok(SubmitOutcome { run_id: None, immediate_result: Some(serde_json::json!({"ok": true})), runtime_data: None })
        }
        fn normalize_webhook(&self, _payload: Value) -> Result<NormalizedEvent, RuntimeError> {
            Err(RuntimeError::Unsupported)
        }
        async fn cancel(&self, _run_id: &noema_model::RunId) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    /// Async test double: hands back a `run_id` and waits for webhooks.
    struct AsyncRuntime {
        next_run_id: Mutex<u32>,
    }

    #[async_trait]
    impl Runtime for AsyncRuntime {
        async fn submit(&self, _g: &GenerationRecord, _inputs: &Value) -> Result<SubmitOutcome, RuntimeError> {
            let mut n = self.next_run_id.lock().unwrap();
            *n += 1;
            Ok(SubmitOutcome { run_id: Some(noema_model::RunId::new(format!("run-{n}"))), immediate_result: None, runtime_data: None })
        }
        fn normalize_webhook(&self, _payload: Value) -> Result<NormalizedEvent, RuntimeError> {
            Err(RuntimeError::Unsupported)
        }
        async fn cancel(&self, _run_id: &noema_model::RunId) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    async fn setup(tool: Tool, runtime: Arc<dyn Runtime>) -> (LifecycleEngine, noema_model::User) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store.upsert_tool(tool.clone()).await.unwrap();
        let registry = Arc::new(ToolRegistry::load(&*store).await.unwrap());
        let runtimes = RuntimeTable::new().register(tool.service, runtime);
        let bus = Arc::new(NotificationBus::new());
        let engine = LifecycleEngine::new(store.clone(), registry, runtimes, bus, PricingTable::new(), "0xms2");
        let (user, _) = store.find_or_create_by_platform(Platform::Telegram, "tg-1", Default::default()).await.unwrap();
        store
            .credit_reward(&user.master_account_id, 100_000, "test credit", "promo")
            .await
            .unwrap();
        let user = store.find_user_by_id(&user.master_account_id).await.unwrap();
        (engine, user)
    }

    fn static_tool(service: Service) -> Tool {
        Tool {
            tool_id: noema_model::ToolId::new("t1"),
            command_name: None,
            display_name: "Test Tool".into(),
            service,
            delivery_mode: DeliveryMode::Async,
            input_schema: InputSchema::default(),
            costing_model: CostingModel::Static { amount: Decimal::new(1, 2) },
            metadata: ToolMetadata::default(),
        }
    }

    #[tokio::test]
    async fn synchronous_runtime_settles_immediately() {
        let (engine, user) = setup(static_tool(Service::Dalle), Arc::new(ImmediateRuntime)).await;
        let outcome = engine
            .execute("t1", serde_json::json!({}), &user, NotificationPlatform::None, ExecuteHints::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, GenerationStatus::Completed);
        assert!(outcome.result.is_some());

        let record = engine.store().find_generation_by_id(&outcome.generation_id).await.unwrap();
        assert_eq!(record.cost_usd, Some(Decimal::new(1, 2)));
        assert!(record.points_spent.unwrap() > 0);
    }

    #[tokio::test]
    async fn async_runtime_leaves_generation_pending_with_run_id() {
        let (engine, user) = setup(static_tool(Service::ComfyUi), Arc::new(AsyncRuntime { next_run_id: Mutex::new(0) })).await;
        let outcome = engine
            .execute("t1", serde_json::json!({}), &user, NotificationPlatform::None, ExecuteHints::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, GenerationStatus::Pending);
        assert!(outcome.poll_url.is_some());

        let record = engine.store().find_generation_by_id(&outcome.generation_id).await.unwrap();
        assert!(record.metadata.run_id.is_some());
    }

    #[tokio::test]
    async fn terminal_webhook_settles_and_is_idempotent_on_replay() {
        let (engine, user) = setup(static_tool(Service::ComfyUi), Arc::new(AsyncRuntime { next_run_id: Mutex::new(0) })).await;
        let outcome = engine
            .execute("t1", serde_json::json!({}), &user, NotificationPlatform::Telegram, ExecuteHints::default())
            .await
            .unwrap();
        let record = engine.store().find_generation_by_id(&outcome.generation_id).await.unwrap();
        let run_id = record.metadata.run_id.clone().unwrap();

        engine
            .handle_runtime_event(NormalizedEvent {
                run_id: run_id.clone(),
                status: NormalizedStatus::Success,
                progress: None,
                live_status: None,
                outputs: Some(serde_json::json!({"url": "https://x"})),
                error: None,
            })
            .await
            .unwrap();

        let settled = engine.store().find_generation_by_id(&outcome.generation_id).await.unwrap();
        assert_eq!(settled.status, GenerationStatus::Completed);
        assert!(settled.cost_usd.is_some());

        // Replaying the same terminal webhook is absorbed, not double-settled.
        engine
            .handle_runtime_event(NormalizedEvent {
                run_id,
                status: NormalizedStatus::Success,
                progress: None,
                live_status: None,
                outputs: None,
                error: None,
            })
            .await
            .unwrap();
        let after_replay = engine.store().find_generation_by_id(&outcome.generation_id).await.unwrap();
        assert_eq!(after_replay.result_payload, settled.result_payload);
    }

    #[tokio::test]
    async fn insufficient_funds_rejects_before_dispatch() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let tool = static_tool(Service::Dalle);
        store.upsert_tool(tool.clone()).await.unwrap();
        let registry = Arc::new(ToolRegistry::load(&*store).await.unwrap());
        let runtimes = RuntimeTable::new().register(tool.service, Arc::new(ImmediateRuntime) as Arc<dyn Runtime>);
        let bus = Arc::new(NotificationBus::new());
        let engine = LifecycleEngine::new(store.clone(), registry, runtimes, bus, PricingTable::new(), "0xms2");
        let (user, _) = store.find_or_create_by_platform(Platform::Telegram, "tg-1", Default::default()).await.unwrap();
        let user = store.find_user_by_id(&user.master_account_id).await.unwrap();

        let result = engine
            .execute("t1", serde_json::json!({}), &user, NotificationPlatform::None, ExecuteHints::default())
            .await;
        assert!(matches!(result, Err(LifecycleError::InsufficientFunds { .. })));
    }
}
