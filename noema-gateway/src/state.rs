use std::sync::Arc;

use noema_lifecycle::{LifecycleEngine, RuntimeTable};
use noema_registry::ToolRegistry;
use noema_scheduler::{CookScheduler, SpellExecutor};
use noema_store::Store;
use noema_x402::X402Handler;

use crate::wallet_link::WalletLinkRegistry;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<ToolRegistry>,
    pub lifecycle: Arc<LifecycleEngine>,
    /// Same adapters registered into the lifecycle engine, kept here too so the webhook
    /// handler can normalise a payload before calling `handle_runtime_event` (§6 webhooks).
    pub runtimes: RuntimeTable,
    pub cooks: Arc<CookScheduler>,
    pub spells: Arc<SpellExecutor>,
    pub x402: Arc<X402Handler>,
    pub wallet_links: Arc<WalletLinkRegistry>,
    /// Compared against `X-Admin-Key` on the internal admin surface (§6 CLI).
    pub admin_key: Arc<String>,
}
