//! Shared helpers for e2e tests: spawn the gateway router on a random port, seed a user and
//! an API key, return the base URL, a ready `reqwest::Client`, and the raw key.

use std::sync::Arc;

use async_trait::async_trait;
use noema_lifecycle::{LifecycleEngine, RuntimeTable};
use noema_model::{
    ApiKey, ApiKeyPermission, ApiKeyStatus, CostingModel, DeliveryMode, GenerationRecord,
    InputSchema, Platform, RunId, Service, Tool, ToolId, ToolMetadata,
};
use noema_notify::NotificationBus;
use noema_pricing::PricingTable;
use noema_registry::ToolRegistry;
use noema_runtimes::{NormalizedEvent, Runtime, RuntimeError, SubmitOutcome};
use noema_scheduler::{CookScheduler, SpellExecutor};
use noema_store::{InMemoryStore, Store};
use noema_x402::{FacilitatorSettlement, PaymentPayload};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

/// Always succeeds immediately; stands in for DALL-E/OpenAI-style synchronous runtimes.
pub struct ImmediateRuntime;

#[async_trait]
impl Runtime for ImmediateRuntime {
    async fn submit(&self, _g: &GenerationRecord, _inputs: &serde_json::Value) -> Result<SubmitOutcome, RuntimeError> {
        Ok(SubmitOutcome { run_id: None, immediate_result: Some(serde_json::json!({"ok": true})), runtime_data: None })
    }
    fn normalize_webhook(&self, _payload: serde_json::Value) -> Result<NormalizedEvent, RuntimeError> {
        Err(RuntimeError::Unsupported)
    }
    async fn cancel(&self, _run_id: &RunId) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Always succeeds on `verify`/`settle` so x402 routes can be exercised without a live
/// facilitator.
pub struct AlwaysApprovingFacilitator;

#[async_trait]
impl noema_x402::FacilitatorClient for AlwaysApprovingFacilitator {
    async fn verify(
        &self,
        payment: &PaymentPayload,
        _requirement: &noema_x402::PaymentRequirement,
    ) -> Result<String, noema_x402::X402Error> {
        let _ = payment;
        Ok("0xpayer".to_string())
    }
    async fn settle(
        &self,
        _payment: &PaymentPayload,
        _requirement: &noema_x402::PaymentRequirement,
    ) -> Result<FacilitatorSettlement, noema_x402::X402Error> {
        Ok(FacilitatorSettlement { transaction: "0xsettled".to_string(), payer: "0xpayer".to_string() })
    }
}

fn sample_tool() -> Tool {
    Tool {
        tool_id: ToolId::new("flux-txt2img"),
        command_name: Some("/flux".into()),
        display_name: "Flux Text to Image".into(),
        service: Service::Dalle,
        delivery_mode: DeliveryMode::Immediate,
        input_schema: InputSchema::default(),
        costing_model: CostingModel::Static { amount: Decimal::new(4, 1) },
        metadata: ToolMetadata::default(),
    }
}

pub struct Harness {
    pub base_url: String,
    pub client: reqwest::Client,
    pub api_key: String,
}

/// Binds a random port, seeds a store with one tool and one funded, API-keyed user, and
/// serves the full gateway router in the background.
pub async fn spawn() -> Harness {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    store.upsert_tool(sample_tool()).await.unwrap();
    let registry = Arc::new(ToolRegistry::load(&*store).await.unwrap());
    let runtimes = RuntimeTable::new().register(Service::Dalle, Arc::new(ImmediateRuntime) as Arc<dyn Runtime>);
    let bus = Arc::new(NotificationBus::new());
    let lifecycle = Arc::new(LifecycleEngine::new(store.clone(), registry.clone(), runtimes.clone(), bus.clone(), PricingTable::new(), "0xms2"));

    let (user, _) = store.find_or_create_by_platform(Platform::Web, "web-1", Default::default()).await.unwrap();
    store.credit_reward(&user.master_account_id, 1_000_000, "test credit", "promo").await.unwrap();

    let raw_key = "nm_live_test_secret_0123456789";
    let prefix = &raw_key[.."nm_live_test".len()];
    let digest = format!("{:x}", Sha256::digest(raw_key.as_bytes()));
    store
        .create_api_key(ApiKey {
            key_prefix: prefix.to_string(),
            secret_sha256: digest,
            master_account_id: user.master_account_id.clone(),
            permissions: vec![ApiKeyPermission::Generate],
            status: ApiKeyStatus::Active,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let cooks = CookScheduler::new(store.clone(), lifecycle.clone(), bus.clone());
    let spells = Arc::new(SpellExecutor::new(store.clone(), lifecycle.clone(), bus.clone()));
    let x402 = Arc::new(noema_x402::X402Handler::new(
        lifecycle.clone(),
        store.clone(),
        Arc::new(AlwaysApprovingFacilitator),
        "0xpaytoaddress",
        "0xusdc",
        120,
    ));

    let state = noema_gateway::AppState {
        store,
        registry,
        lifecycle,
        runtimes,
        cooks,
        spells,
        x402,
        wallet_links: Arc::new(noema_gateway::wallet_link::WalletLinkRegistry::new()),
        admin_key: Arc::new("test-admin-key".to_string()),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = noema_gateway::build(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness { base_url: format!("http://{addr}"), client: reqwest::Client::new(), api_key: raw_key.to_string() }
}
