//! Persistence layer presenting typed operations, no business logic (§4.A).
//!
//! Multi-record mutations that must be consistent are exposed as single named operations
//! (`settle_generation`, `record_cook_piece`) rather than a raw transaction handle, so the
//! trait stays object-safe: each one runs inside its own DB transaction internally.

use async_trait::async_trait;
use rust_decimal::Decimal;

use noema_model::{
    ApiKey, Cook, Deposit, GenerationId, GenerationRecord, LoraModel, LoraPermission,
    MasterAccountId, Platform, RunId, Spell, SpellCast, SpellCastId, Tool, ToolId, User, Wallet,
};

use crate::error::StoreError;
use crate::filter::{GenerationFilter, GenerationPatch};

/// Hints passed on first contact (display name, etc) used only when a new user is created.
#[derive(Clone, Debug, Default)]
pub struct NewUserHints {
    pub display_name: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- Users ---
    async fn find_or_create_by_platform(
        &self,
        platform: Platform,
        platform_id: &str,
        hints: NewUserHints,
    ) -> Result<(User, bool), StoreError>;
    async fn find_user_by_id(&self, id: &MasterAccountId) -> Result<User, StoreError>;
    async fn find_user_by_platform(
        &self,
        platform: Platform,
        platform_id: &str,
    ) -> Result<User, StoreError>;

    // --- Wallets ---
    async fn list_wallets(&self, user_id: &MasterAccountId) -> Result<Vec<Wallet>, StoreError>;
    async fn add_wallet(&self, user_id: &MasterAccountId, wallet: Wallet) -> Result<(), StoreError>;
    async fn update_wallet(&self, user_id: &MasterAccountId, wallet: Wallet) -> Result<(), StoreError>;
    async fn delete_wallet(&self, user_id: &MasterAccountId, address: &str) -> Result<(), StoreError>;

    // --- Ledger ---
    async fn record_deposit_if_new(&self, deposit: Deposit) -> Result<Deposit, StoreError>;
    /// PENDING -> CONFIRMED once the deposit oracle reports enough on-chain confirmations.
    async fn confirm_deposit(&self, deposit_id: &noema_model::DepositId) -> Result<Deposit, StoreError>;
    async fn find_active_deposits_for_user(
        &self,
        id: &MasterAccountId,
    ) -> Result<Vec<Deposit>, StoreError>;
    async fn find_active_deposits_for_wallet(&self, address: &str) -> Result<Vec<Deposit>, StoreError>;
    /// Conditional debit: succeeds only if `pointsRemaining >= amount`. Returns `false` (no
    /// mutation) if the deposit can't cover it so the caller can retry or move on (§4.C step 4).
    async fn deduct_points_from_deposit(
        &self,
        deposit_id: &noema_model::DepositId,
        amount: i64,
    ) -> Result<bool, StoreError>;
    async fn sum_points_remaining(&self, id: &MasterAccountId) -> Result<i64, StoreError>;
    async fn has_confirmed_deposit_with_token(
        &self,
        id: &MasterAccountId,
        token_address: &str,
    ) -> Result<bool, StoreError>;
    async fn credit_reward(
        &self,
        user_id: &MasterAccountId,
        points: i64,
        description: &str,
        reward_type: &str,
    ) -> Result<Deposit, StoreError>;
    /// Records an unrecoverable debt against a completed generation when settlement still
    /// came up short after the pre-flight quote (§4.F cost-settlement-failure handling).
    async fn record_ledger_deficit(
        &self,
        user_id: &MasterAccountId,
        generation_id: &GenerationId,
        points: i64,
    ) -> Result<(), StoreError>;

    // --- Generations ---
    async fn create_generation(&self, generation: GenerationRecord) -> Result<GenerationRecord, StoreError>;
    async fn update_generation(
        &self,
        id: &GenerationId,
        patch: GenerationPatch,
    ) -> Result<GenerationRecord, StoreError>;
    async fn find_generation_by_id(&self, id: &GenerationId) -> Result<GenerationRecord, StoreError>;
    async fn find_generation_by_run_id(&self, run_id: &RunId) -> Result<GenerationRecord, StoreError>;
    async fn find_generations(&self, filter: GenerationFilter) -> Result<Vec<GenerationRecord>, StoreError>;
    /// Atomically applies FIFO deposit deductions and the terminal patch in one transaction
    /// (§4.F step 7, §4.A "cost debit across several deposits" consistency requirement).
    async fn settle_generation(
        &self,
        id: &GenerationId,
        deductions: Vec<(noema_model::DepositId, i64)>,
        patch: GenerationPatch,
    ) -> Result<GenerationRecord, StoreError>;

    // --- Tools ---
    async fn list_tools(&self) -> Result<Vec<Tool>, StoreError>;
    async fn upsert_tool(&self, tool: Tool) -> Result<(), StoreError>;

    // --- Cooks ---
    async fn create_cook(&self, cook: Cook) -> Result<Cook, StoreError>;
    async fn find_cook_by_id(&self, id: &noema_model::CookId) -> Result<Cook, StoreError>;
    async fn update_cook_status(
        &self,
        id: &noema_model::CookId,
        status: noema_model::CookStatus,
    ) -> Result<Cook, StoreError>;
    async fn list_cooks_running(&self) -> Result<Vec<Cook>, StoreError>;
    async fn list_cooks_for_user(
        &self,
        user_id: &MasterAccountId,
        status: Option<noema_model::CookStatus>,
    ) -> Result<Vec<Cook>, StoreError>;
    /// Atomically appends a piece, bumps `generatedCount`, accrues `costUsd` (§4.G step 3).
    async fn record_cook_piece(
        &self,
        id: &noema_model::CookId,
        generation_id: GenerationId,
        cost: Decimal,
        accepted: Option<bool>,
    ) -> Result<Cook, StoreError>;
    async fn review_cook_piece(
        &self,
        id: &noema_model::CookId,
        generation_id: &GenerationId,
        accept: bool,
    ) -> Result<Cook, StoreError>;

    // --- Spells ---
    async fn create_spell(&self, spell: Spell) -> Result<Spell, StoreError>;
    async fn find_spell_by_slug(&self, slug: &str) -> Result<Spell, StoreError>;
    async fn list_spells_public(&self) -> Result<Vec<Spell>, StoreError>;
    async fn create_spell_cast(&self, cast: SpellCast) -> Result<SpellCast, StoreError>;
    async fn update_spell_cast(&self, cast: SpellCast) -> Result<SpellCast, StoreError>;
    async fn find_spell_cast(&self, id: &SpellCastId) -> Result<SpellCast, StoreError>;

    // --- LoRAs ---
    async fn list_loras(&self) -> Result<Vec<LoraModel>, StoreError>;
    async fn find_lora_by_slug(&self, slug: &str) -> Result<LoraModel, StoreError>;
    async fn upsert_lora(&self, lora: LoraModel) -> Result<(), StoreError>;
    async fn grant_lora_permission(&self, permission: LoraPermission) -> Result<(), StoreError>;
    async fn has_lora_permission(&self, slug: &str, user_id: &MasterAccountId) -> Result<bool, StoreError>;

    // --- API keys ---
    async fn create_api_key(&self, key: ApiKey) -> Result<ApiKey, StoreError>;
    async fn find_api_key_by_prefix(&self, prefix: &str) -> Result<ApiKey, StoreError>;
    async fn revoke_api_key(&self, prefix: &str) -> Result<(), StoreError>;

    // --- Background worker admin control (§6 CLI: export-worker pause/resume/status) ---
    async fn get_worker_control(&self, worker: &str) -> Result<crate::filter::WorkerControl, StoreError>;
    async fn set_worker_control(
        &self,
        worker: &str,
        control: crate::filter::WorkerControl,
    ) -> Result<crate::filter::WorkerControl, StoreError>;
}
