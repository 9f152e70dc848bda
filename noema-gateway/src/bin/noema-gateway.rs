//! Process entry point: wires the store, tool registry, runtimes, and lifecycle engine,
//! then serves the combined REST/MCP/x402 router (§4.J, §6 required env vars).

use std::env;
use std::sync::Arc;

use noema_lifecycle::{LifecycleEngine, RuntimeTable};
use noema_model::Service;
use noema_notify::NotificationBus;
use noema_pricing::PricingTable;
use noema_registry::ToolRegistry;
use noema_runtimes::{ComfyDeployRuntime, OpenAiRuntime, Runtime, VastAiRuntime};
use noema_scheduler::{CookScheduler, SpellExecutor, TrainingMonitor};
use noema_store::{SqliteStore, Store};
use noema_x402::{HttpFacilitatorClient, X402Handler};

fn required(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("missing required environment variable {key}"))
}

#[tokio::main]
async fn main() {
    noema_config::load_and_apply("noema", None).expect("failed to load configuration");
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let db_path = env::var("NOEMA_DB_PATH").unwrap_or_else(|_| "noema.sqlite3".to_string());
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&db_path).expect("failed to open sqlite store"));

    let registry = Arc::new(ToolRegistry::load(&*store).await.expect("failed to load tool registry"));

    let mut runtimes = RuntimeTable::new();
    if let Ok(comfy_key) = env::var("COMFYDEPLOY_API_KEY") {
        let base_url = env::var("COMFYDEPLOY_BASE_URL").unwrap_or_else(|_| "https://api.comfydeploy.com".to_string());
        runtimes = runtimes.register(Service::ComfyUi, Arc::new(ComfyDeployRuntime::new(comfy_key, base_url)) as Arc<dyn Runtime>);
    }
    if let Ok(openai_key) = env::var("OPENAI_API_KEY") {
        runtimes = runtimes.register(Service::Dalle, Arc::new(OpenAiRuntime::new(openai_key.clone())) as Arc<dyn Runtime>);
        runtimes = runtimes.register(Service::OpenAiChat, Arc::new(OpenAiRuntime::new(openai_key)) as Arc<dyn Runtime>);
    }
    let mut vastai_runtime: Option<Arc<VastAiRuntime>> = None;
    if let Ok(vastai_key) = env::var("VASTAI_API_KEY") {
        let ssh_key_path = required("VASTAI_SSH_KEY_PATH");
        let hf_token = env::var("HUGGINGFACE_TOKEN").unwrap_or_default();
        let r2_endpoint = env::var("R2_ENDPOINT").unwrap_or_default();
        let gpu_types = env::var("VASTAI_GPU_TYPES").unwrap_or_default().split(',').map(str::to_string).filter(|s| !s.is_empty()).collect();
        let runtime = Arc::new(VastAiRuntime::new(vastai_key, ssh_key_path, gpu_types, hf_token, r2_endpoint));
        runtimes = runtimes.register(Service::VastAiTraining, runtime.clone() as Arc<dyn Runtime>);
        vastai_runtime = Some(runtime);
    }

    let bus = Arc::new(NotificationBus::new());
    let ms2_token_address = env::var("MS2_TOKEN_ADDRESS").unwrap_or_default();
    let lifecycle = Arc::new(LifecycleEngine::new(store.clone(), registry.clone(), runtimes.clone(), bus.clone(), PricingTable::new(), ms2_token_address));

    let cooks = CookScheduler::new(store.clone(), lifecycle.clone(), bus.clone());
    cooks.resume_all_on_boot().await.expect("failed to resume running cooks");
    let spells = Arc::new(SpellExecutor::new(store.clone(), lifecycle.clone(), bus.clone()));

    if let Some(runtime) = vastai_runtime {
        let monitor = TrainingMonitor::new(store.clone(), lifecycle.clone(), runtime);
        monitor.spawn_discovery_loop();
    }

    let facilitator_url = env::var("X402_FACILITATOR_URL").unwrap_or_else(|_| "https://x402.org/facilitator".to_string());
    let facilitator = Arc::new(HttpFacilitatorClient::new(facilitator_url));
    let pay_to = env::var("X402_PAY_TO_ADDRESS").unwrap_or_default();
    let usdc_asset = env::var("X402_USDC_ASSET").unwrap_or_else(|_| "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".to_string());
    let x402 = Arc::new(X402Handler::new(lifecycle.clone(), store.clone(), facilitator, pay_to, usdc_asset, 120));

    let state = noema_gateway::AppState {
        store,
        registry,
        lifecycle,
        runtimes,
        cooks,
        spells,
        x402,
        wallet_links: Arc::new(noema_gateway::wallet_link::WalletLinkRegistry::new()),
        admin_key: Arc::new(required("INTERNAL_API_KEY_ADMIN")),
    };

    let app = noema_gateway::build(state);
    let addr = env::var("NOEMA_GATEWAY_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind gateway listener");
    tracing::info!(%addr, "noema-gateway listening");
    axum::serve(listener, app).await.expect("gateway server failed");
}
