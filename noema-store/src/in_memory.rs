//! In-process `Store` over `Mutex`-guarded maps. Used by tests and by any crate's unit
//! tests that need a real `Store` without a filesystem (mirrors the teacher's
//! `InMemoryCache` pattern).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use noema_model::{
    ApiKey, Cook, CookId, CookStatus, Deposit, DepositId, DepositOrigin, DepositOwner,
    DepositStatus, GenerationId, GenerationRecord, LoraModel, LoraPermission, MasterAccountId,
    Platform, PlatformIdentity, RunId, Spell, SpellCast, SpellCastId, Tool, ToolId, User, Wallet,
};

use crate::error::StoreError;
use crate::filter::{GenerationFilter, GenerationPatch, WorkerControl};
use crate::traits::{NewUserHints, Store};

#[derive(Default)]
struct Inner {
    users: HashMap<MasterAccountId, User>,
    deposits: HashMap<DepositId, Deposit>,
    generations: HashMap<GenerationId, GenerationRecord>,
    run_id_index: HashMap<RunId, GenerationId>,
    tools: HashMap<ToolId, Tool>,
    cooks: HashMap<CookId, Cook>,
    spells: HashMap<String, Spell>,
    spell_casts: HashMap<SpellCastId, SpellCast>,
    loras: HashMap<String, LoraModel>,
    lora_permissions: Vec<LoraPermission>,
    api_keys: HashMap<String, ApiKey>,
    ledger_deficits: Vec<(MasterAccountId, GenerationId, i64)>,
    worker_controls: HashMap<String, WorkerControl>,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_patch(record: &mut GenerationRecord, patch: GenerationPatch) {
        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(ds) = patch.delivery_status {
            record.delivery_status = ds;
        }
        if let Some(np) = patch.notification_platform {
            record.notification_platform = np;
        }
        if patch.run_id_set {
            record.metadata.run_id = patch.run_id;
        }
        if let Some(progress) = patch.progress {
            record.progress = Some(progress);
        }
        if let Some(live_status) = patch.live_status {
            record.live_status = Some(live_status);
        }
        if let Some(ts) = patch.response_timestamp {
            record.response_timestamp = Some(ts);
        }
        if let Some(d) = patch.duration_ms {
            record.duration_ms = Some(d);
        }
        if let Some(cost) = patch.cost_usd {
            record.cost_usd = Some(cost);
        }
        if let Some(points) = patch.points_spent {
            record.points_spent = Some(points);
        }
        if let Some(result) = patch.result_payload {
            record.result_payload = Some(result);
        }
        if let Some(error) = patch.error {
            record.error = Some(error);
        }
        if let Some(x402) = patch.x402 {
            record.metadata.x402 = Some(x402);
        }
        if let Some(runtime_data) = patch.runtime_data {
            record.metadata.runtime_data = Some(runtime_data);
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_or_create_by_platform(
        &self,
        platform: Platform,
        platform_id: &str,
        hints: NewUserHints,
    ) -> Result<(User, bool), StoreError> {
        let mut inner = self.lock();
        if let Some(user) = inner.users.values().find(|u| {
            u.identities
                .iter()
                .any(|i| i.platform == platform && i.platform_id == platform_id)
        }) {
            return Ok((user.clone(), false));
        }
        let id = loop {
            let raw = uuid::Uuid::new_v4().simple().to_string();
            let candidate = MasterAccountId::parse(&raw[..24]).expect("uuid hex prefix is valid");
            if !inner.users.contains_key(&candidate) {
                break candidate;
            }
        };
        let mut user = User::new(
            id.clone(),
            PlatformIdentity {
                platform,
                platform_id: platform_id.to_string(),
            },
        );
        user.display_name = hints.display_name;
        inner.users.insert(id, user.clone());
        Ok((user, true))
    }

    async fn find_user_by_id(&self, id: &MasterAccountId) -> Result<User, StoreError> {
        self.lock()
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    async fn find_user_by_platform(
        &self,
        platform: Platform,
        platform_id: &str,
    ) -> Result<User, StoreError> {
        self.lock()
            .users
            .values()
            .find(|u| {
                u.identities
                    .iter()
                    .any(|i| i.platform == platform && i.platform_id == platform_id)
            })
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user for platform id {platform_id}")))
    }

    async fn list_wallets(&self, user_id: &MasterAccountId) -> Result<Vec<Wallet>, StoreError> {
        Ok(self.find_user_by_id(user_id).await?.wallets)
    }

    async fn add_wallet(&self, user_id: &MasterAccountId, wallet: Wallet) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        if wallet.is_primary {
            for w in user.wallets.iter_mut() {
                w.is_primary = false;
            }
        }
        user.wallets.push(wallet);
        Ok(())
    }

    async fn update_wallet(&self, user_id: &MasterAccountId, wallet: Wallet) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        if wallet.is_primary {
            for w in user.wallets.iter_mut() {
                w.is_primary = false;
            }
        }
        let slot = user
            .wallets
            .iter_mut()
            .find(|w| w.address == wallet.address)
            .ok_or_else(|| StoreError::NotFound(format!("wallet {}", wallet.address)))?;
        *slot = wallet;
        Ok(())
    }

    async fn delete_wallet(&self, user_id: &MasterAccountId, address: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.wallets.retain(|w| w.address != address);
        Ok(())
    }

    async fn record_deposit_if_new(&self, deposit: Deposit) -> Result<Deposit, StoreError> {
        let mut inner = self.lock();
        if let Some(hash) = deposit.deposit_tx_hash() {
            if let Some(existing) = inner.deposits.values().find(|d| d.deposit_tx_hash() == Some(hash)) {
                return Ok(existing.clone());
            }
        }
        inner.deposits.insert(deposit.id.clone(), deposit.clone());
        Ok(deposit)
    }

    async fn confirm_deposit(&self, deposit_id: &DepositId) -> Result<Deposit, StoreError> {
        let mut inner = self.lock();
        let deposit = inner
            .deposits
            .get_mut(deposit_id)
            .ok_or_else(|| StoreError::NotFound(format!("deposit {deposit_id}")))?;
        deposit.status = DepositStatus::Confirmed;
        Ok(deposit.clone())
    }

    async fn find_active_deposits_for_user(&self, id: &MasterAccountId) -> Result<Vec<Deposit>, StoreError> {
        let mut deposits: Vec<Deposit> = self
            .lock()
            .deposits
            .values()
            .filter(|d| d.is_active() && matches!(&d.owner, DepositOwner::Account(owner) if owner == id))
            .cloned()
            .collect();
        deposits.sort_by(|a, b| {
            a.funding_rate_applied
                .cmp(&b.funding_rate_applied)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(deposits)
    }

    async fn find_active_deposits_for_wallet(&self, address: &str) -> Result<Vec<Deposit>, StoreError> {
        let mut deposits: Vec<Deposit> = self
            .lock()
            .deposits
            .values()
            .filter(|d| {
                d.is_active()
                    && matches!(&d.owner, DepositOwner::DepositorAddress(a) if a.eq_ignore_ascii_case(address))
            })
            .cloned()
            .collect();
        deposits.sort_by(|a, b| {
            a.funding_rate_applied
                .cmp(&b.funding_rate_applied)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(deposits)
    }

    async fn deduct_points_from_deposit(&self, deposit_id: &DepositId, amount: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let deposit = inner
            .deposits
            .get_mut(deposit_id)
            .ok_or_else(|| StoreError::NotFound(format!("deposit {deposit_id}")))?;
        if deposit.points_remaining < amount {
            return Ok(false);
        }
        deposit.points_remaining -= amount;
        if deposit.points_remaining == 0 {
            deposit.status = DepositStatus::Exhausted;
        }
        Ok(true)
    }

    async fn sum_points_remaining(&self, id: &MasterAccountId) -> Result<i64, StoreError> {
        Ok(self
            .find_active_deposits_for_user(id)
            .await?
            .iter()
            .map(|d| d.points_remaining)
            .sum())
    }

    async fn has_confirmed_deposit_with_token(
        &self,
        id: &MasterAccountId,
        token_address: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.lock().deposits.values().any(|d| {
            d.status == DepositStatus::Confirmed
                && matches!(&d.owner, DepositOwner::Account(owner) if owner == id)
                && d.token_address.eq_ignore_ascii_case(token_address)
        }))
    }

    async fn credit_reward(
        &self,
        user_id: &MasterAccountId,
        points: i64,
        description: &str,
        reward_type: &str,
    ) -> Result<Deposit, StoreError> {
        let deposit = Deposit {
            id: DepositId::generate(),
            owner: DepositOwner::Account(user_id.clone()),
            origin: DepositOrigin::Reward {
                reward_type: reward_type.to_string(),
                description: description.to_string(),
            },
            token_address: String::new(),
            usd_value: Decimal::ZERO,
            points_credited: points,
            points_remaining: points,
            funding_rate_applied: Decimal::ZERO,
            status: DepositStatus::Confirmed,
            created_at: Utc::now(),
        };
        self.lock().deposits.insert(deposit.id.clone(), deposit.clone());
        Ok(deposit)
    }

    async fn record_ledger_deficit(
        &self,
        user_id: &MasterAccountId,
        generation_id: &GenerationId,
        points: i64,
    ) -> Result<(), StoreError> {
        self.lock()
            .ledger_deficits
            .push((user_id.clone(), generation_id.clone(), points));
        Ok(())
    }

    async fn create_generation(&self, generation: GenerationRecord) -> Result<GenerationRecord, StoreError> {
        let mut inner = self.lock();
        if let Some(run_id) = generation.metadata.run_id.clone() {
            inner.run_id_index.insert(run_id, generation.id.clone());
        }
        inner.generations.insert(generation.id.clone(), generation.clone());
        Ok(generation)
    }

    async fn update_generation(
        &self,
        id: &GenerationId,
        patch: GenerationPatch,
    ) -> Result<GenerationRecord, StoreError> {
        let mut inner = self.lock();
        let new_run_id = patch.run_id.clone();
        let run_id_set = patch.run_id_set;
        let record = inner
            .generations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("generation {id}")))?;
        Self::apply_patch(record, patch);
        let updated = record.clone();
        if run_id_set {
            if let Some(run_id) = new_run_id {
                inner.run_id_index.insert(run_id, id.clone());
            }
        }
        Ok(updated)
    }

    async fn find_generation_by_id(&self, id: &GenerationId) -> Result<GenerationRecord, StoreError> {
        self.lock()
            .generations
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("generation {id}")))
    }

    async fn find_generation_by_run_id(&self, run_id: &RunId) -> Result<GenerationRecord, StoreError> {
        let inner = self.lock();
        let id = inner
            .run_id_index
            .get(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run_id {run_id}")))?;
        inner
            .generations
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("generation {id}")))
    }

    async fn find_generations(&self, filter: GenerationFilter) -> Result<Vec<GenerationRecord>, StoreError> {
        let inner = self.lock();
        let mut out: Vec<GenerationRecord> = inner
            .generations
            .values()
            .filter(|g| {
                filter
                    .master_account_id
                    .as_ref()
                    .map_or(true, |id| &g.master_account_id == id)
                    && filter.status.map_or(true, |s| g.status == s)
                    && filter
                        .cook_execution_id
                        .as_ref()
                        .map_or(true, |id| g.metadata.cook_execution_id.as_ref() == Some(id))
                    && filter
                        .spell_cast_id
                        .as_ref()
                        .map_or(true, |id| g.metadata.spell_cast_id.as_ref() == Some(id))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.request_timestamp.cmp(&b.request_timestamp));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn settle_generation(
        &self,
        id: &GenerationId,
        deductions: Vec<(DepositId, i64)>,
        patch: GenerationPatch,
    ) -> Result<GenerationRecord, StoreError> {
        let mut inner = self.lock();
        for (deposit_id, amount) in &deductions {
            let deposit = inner
                .deposits
                .get(deposit_id)
                .ok_or_else(|| StoreError::NotFound(format!("deposit {deposit_id}")))?;
            if deposit.points_remaining < *amount {
                return Err(StoreError::Conflict(format!(
                    "deposit {deposit_id} can no longer cover {amount} points"
                )));
            }
        }
        for (deposit_id, amount) in &deductions {
            let deposit = inner.deposits.get_mut(deposit_id).unwrap();
            deposit.points_remaining -= amount;
            if deposit.points_remaining == 0 {
                deposit.status = DepositStatus::Exhausted;
            }
        }
        let record = inner
            .generations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("generation {id}")))?;
        Self::apply_patch(record, patch);
        Ok(record.clone())
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, StoreError> {
        Ok(self.lock().tools.values().cloned().collect())
    }

    async fn upsert_tool(&self, tool: Tool) -> Result<(), StoreError> {
        self.lock().tools.insert(tool.tool_id.clone(), tool);
        Ok(())
    }

    async fn create_cook(&self, cook: Cook) -> Result<Cook, StoreError> {
        self.lock().cooks.insert(cook.id.clone(), cook.clone());
        Ok(cook)
    }

    async fn find_cook_by_id(&self, id: &CookId) -> Result<Cook, StoreError> {
        self.lock()
            .cooks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("cook {id}")))
    }

    async fn update_cook_status(&self, id: &CookId, status: CookStatus) -> Result<Cook, StoreError> {
        let mut inner = self.lock();
        let cook = inner
            .cooks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("cook {id}")))?;
        cook.status = status;
        if status.is_terminal() {
            cook.completed_at = Some(Utc::now());
        }
        Ok(cook.clone())
    }

    async fn list_cooks_running(&self) -> Result<Vec<Cook>, StoreError> {
        Ok(self
            .lock()
            .cooks
            .values()
            .filter(|c| c.status == CookStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_cooks_for_user(
        &self,
        user_id: &MasterAccountId,
        status: Option<CookStatus>,
    ) -> Result<Vec<Cook>, StoreError> {
        Ok(self
            .lock()
            .cooks
            .values()
            .filter(|c| &c.master_account_id == user_id && status.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    async fn record_cook_piece(
        &self,
        id: &CookId,
        generation_id: GenerationId,
        cost: Decimal,
        accepted: Option<bool>,
    ) -> Result<Cook, StoreError> {
        let mut inner = self.lock();
        let cook = inner
            .cooks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("cook {id}")))?;
        cook.record_piece(generation_id, cost, accepted);
        Ok(cook.clone())
    }

    async fn review_cook_piece(
        &self,
        id: &CookId,
        generation_id: &GenerationId,
        accept: bool,
    ) -> Result<Cook, StoreError> {
        let mut inner = self.lock();
        let cook = inner
            .cooks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("cook {id}")))?;
        cook.review(generation_id, accept);
        Ok(cook.clone())
    }

    async fn create_spell(&self, spell: Spell) -> Result<Spell, StoreError> {
        let mut inner = self.lock();
        if inner.spells.contains_key(&spell.slug) {
            return Err(StoreError::Conflict(format!("spell slug {} exists", spell.slug)));
        }
        inner.spells.insert(spell.slug.clone(), spell.clone());
        Ok(spell)
    }

    async fn find_spell_by_slug(&self, slug: &str) -> Result<Spell, StoreError> {
        self.lock()
            .spells
            .get(slug)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("spell {slug}")))
    }

    async fn list_spells_public(&self) -> Result<Vec<Spell>, StoreError> {
        Ok(self
            .lock()
            .spells
            .values()
            .filter(|s| s.visibility == noema_model::Visibility::Public)
            .cloned()
            .collect())
    }

    async fn create_spell_cast(&self, cast: SpellCast) -> Result<SpellCast, StoreError> {
        self.lock().spell_casts.insert(cast.cast_id.clone(), cast.clone());
        Ok(cast)
    }

    async fn update_spell_cast(&self, cast: SpellCast) -> Result<SpellCast, StoreError> {
        let mut inner = self.lock();
        if !inner.spell_casts.contains_key(&cast.cast_id) {
            return Err(StoreError::NotFound(format!("spell cast {}", cast.cast_id)));
        }
        inner.spell_casts.insert(cast.cast_id.clone(), cast.clone());
        Ok(cast)
    }

    async fn find_spell_cast(&self, id: &SpellCastId) -> Result<SpellCast, StoreError> {
        self.lock()
            .spell_casts
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("spell cast {id}")))
    }

    async fn list_loras(&self) -> Result<Vec<LoraModel>, StoreError> {
        Ok(self.lock().loras.values().cloned().collect())
    }

    async fn find_lora_by_slug(&self, slug: &str) -> Result<LoraModel, StoreError> {
        self.lock()
            .loras
            .get(slug)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("lora {slug}")))
    }

    async fn upsert_lora(&self, lora: LoraModel) -> Result<(), StoreError> {
        self.lock().loras.insert(lora.slug.clone(), lora);
        Ok(())
    }

    async fn grant_lora_permission(&self, permission: LoraPermission) -> Result<(), StoreError> {
        self.lock().lora_permissions.push(permission);
        Ok(())
    }

    async fn has_lora_permission(&self, slug: &str, user_id: &MasterAccountId) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .lora_permissions
            .iter()
            .any(|p| p.lora_slug == slug && &p.master_account_id == user_id))
    }

    async fn create_api_key(&self, key: ApiKey) -> Result<ApiKey, StoreError> {
        let mut inner = self.lock();
        if inner.api_keys.contains_key(&key.key_prefix) {
            return Err(StoreError::Conflict(format!("api key prefix {} exists", key.key_prefix)));
        }
        inner.api_keys.insert(key.key_prefix.clone(), key.clone());
        Ok(key)
    }

    async fn find_api_key_by_prefix(&self, prefix: &str) -> Result<ApiKey, StoreError> {
        self.lock()
            .api_keys
            .get(prefix)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("api key {prefix}")))
    }

    async fn revoke_api_key(&self, prefix: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = inner
            .api_keys
            .get_mut(prefix)
            .ok_or_else(|| StoreError::NotFound(format!("api key {prefix}")))?;
        key.status = noema_model::ApiKeyStatus::Revoked;
        Ok(())
    }

    async fn get_worker_control(&self, worker: &str) -> Result<WorkerControl, StoreError> {
        Ok(self.lock().worker_controls.get(worker).cloned().unwrap_or_default())
    }

    async fn set_worker_control(&self, worker: &str, control: WorkerControl) -> Result<WorkerControl, StoreError> {
        let mut inner = self.lock();
        inner.worker_controls.insert(worker.to_string(), control.clone());
        Ok(control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_or_create_is_idempotent_per_platform_identity() {
        let store = InMemoryStore::new();
        let (user1, created1) = store
            .find_or_create_by_platform(Platform::Telegram, "tg-1", NewUserHints::default())
            .await
            .unwrap();
        assert!(created1);
        let (user2, created2) = store
            .find_or_create_by_platform(Platform::Telegram, "tg-1", NewUserHints::default())
            .await
            .unwrap();
        assert!(!created2);
        assert_eq!(user1.master_account_id, user2.master_account_id);
    }

    #[tokio::test]
    async fn deduct_fails_when_insufficient_and_marks_exhausted_at_zero() {
        let store = InMemoryStore::new();
        let deposit = Deposit {
            id: DepositId::generate(),
            owner: DepositOwner::Account(MasterAccountId::parse("a".repeat(24)).unwrap()),
            origin: DepositOrigin::OnChainDeposit { deposit_tx_hash: "0xabc".into() },
            token_address: "0xusdc".into(),
            usd_value: Decimal::new(100, 2),
            points_credited: 100,
            points_remaining: 100,
            funding_rate_applied: Decimal::new(5, 2),
            status: DepositStatus::Confirmed,
            created_at: Utc::now(),
        };
        let deposit = store.record_deposit_if_new(deposit).await.unwrap();
        assert!(!store.deduct_points_from_deposit(&deposit.id, 200).await.unwrap());
        assert!(store.deduct_points_from_deposit(&deposit.id, 100).await.unwrap());
        let remaining = store
            .find_active_deposits_for_user(&match &deposit.owner {
                DepositOwner::Account(id) => id.clone(),
                _ => unreachable!(),
            })
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn record_deposit_if_new_is_idempotent_by_tx_hash() {
        let store = InMemoryStore::new();
        let make = || Deposit {
            id: DepositId::generate(),
            owner: DepositOwner::Account(MasterAccountId::parse("b".repeat(24)).unwrap()),
            origin: DepositOrigin::OnChainDeposit { deposit_tx_hash: "0xdup".into() },
            token_address: "0xusdc".into(),
            usd_value: Decimal::new(500, 2),
            points_credited: 500,
            points_remaining: 500,
            funding_rate_applied: Decimal::ZERO,
            status: DepositStatus::Confirmed,
            created_at: Utc::now(),
        };
        let first = store.record_deposit_if_new(make()).await.unwrap();
        let second = store.record_deposit_if_new(make()).await.unwrap();
        assert_eq!(first.id, second.id);
    }
}
