//! Credit ledger: FIFO deposit debiting, deposit recording, reward crediting (§4.C).
//!
//! Built entirely on `noema_store::Store`; this crate holds the FIFO ordering and
//! all-or-nothing semantics, not storage.

use rust_decimal::Decimal;
use thiserror::Error;

use noema_model::{Deposit, DepositId, GenerationId, MasterAccountId, User};
use noema_store::{GenerationPatch, Store, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: need {needed} points, have {available}")]
    InsufficientFunds { needed: i64, available: i64 },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// One deposit's contribution to a spend, as returned by `spend` (§4.C).
#[derive(Clone, Debug, PartialEq)]
pub struct Deduction {
    pub deposit_id: DepositId,
    pub points_deducted: i64,
    pub funding_rate: Decimal,
    pub token_address: String,
}

/// Deposits eligible for this user's spend: their own if any exist, else their linked
/// wallets' (§4.C step 1: "wallet only if user-set empty"), already FIFO-ordered by the
/// store (funding rate ascending, then age ascending).
async fn candidate_deposits(store: &dyn Store, user: &User) -> Result<Vec<Deposit>, LedgerError> {
    let owned = store.find_active_deposits_for_user(&user.master_account_id).await?;
    if !owned.is_empty() {
        return Ok(owned);
    }
    let mut pooled = Vec::new();
    for wallet in &user.wallets {
        pooled.extend(store.find_active_deposits_for_wallet(&wallet.address).await?);
    }
    pooled.sort_by(|a, b| {
        a.funding_rate_applied
            .cmp(&b.funding_rate_applied)
            .then(a.created_at.cmp(&b.created_at))
    });
    Ok(pooled)
}

/// Non-mutating feasibility check (§4.C `quote`): can this user cover `points_to_spend`?
pub async fn quote(store: &dyn Store, user: &User, points_to_spend: i64) -> Result<bool, LedgerError> {
    let available: i64 = candidate_deposits(store, user).await?.iter().map(|d| d.points_remaining).sum();
    Ok(available >= points_to_spend)
}

/// Walks the FIFO deposit list and builds an exact deduction plan summing to
/// `points_to_spend`, without mutating anything (§4.C steps 1-2).
fn plan(deposits: &[Deposit], points_to_spend: i64) -> Result<Vec<Deduction>, LedgerError> {
    let mut remaining_need = points_to_spend;
    let mut deductions = Vec::new();
    for deposit in deposits {
        if remaining_need <= 0 {
            break;
        }
        let take = remaining_need.min(deposit.points_remaining);
        if take <= 0 {
            continue;
        }
        deductions.push(Deduction {
            deposit_id: deposit.id.clone(),
            points_deducted: take,
            funding_rate: deposit.funding_rate_applied,
            token_address: deposit.token_address.clone(),
        });
        remaining_need -= take;
    }
    if remaining_need > 0 {
        let available: i64 = deposits.iter().map(|d| d.points_remaining).sum();
        return Err(LedgerError::InsufficientFunds {
            needed: points_to_spend,
            available,
        });
    }
    Ok(deductions)
}

/// Debits `points_to_spend` from `user`'s FIFO deposit stream and applies `patch` to the
/// named generation in one store transaction (§4.C `spend`, §4.F step 7). If a deposit was
/// drained by a concurrent spend between planning and commit, the whole plan is rebuilt once
/// against fresh state and retried (§4.C step 4: "reload & retry once"); a second failure
/// surfaces as `InsufficientFunds` for the caller to handle per the cost-settlement-failure
/// rules in §4.F.
pub async fn spend(
    store: &dyn Store,
    user: &User,
    generation_id: &GenerationId,
    points_to_spend: i64,
    patch: GenerationPatch,
) -> Result<(Vec<Deduction>, noema_model::GenerationRecord), LedgerError> {
    for attempt in 0..2 {
        let deposits = candidate_deposits(store, user).await?;
        let deductions = plan(&deposits, points_to_spend)?;
        let store_deductions = deductions
            .iter()
            .map(|d| (d.deposit_id.clone(), d.points_deducted))
            .collect();
        match store
            .settle_generation(generation_id, store_deductions, patch.clone())
            .await
        {
            Ok(record) => return Ok((deductions, record)),
            Err(StoreError::Conflict(_)) if attempt == 0 => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(LedgerError::InsufficientFunds {
        needed: points_to_spend,
        available: 0,
    })
}

/// Idempotent by `depositTxHash` (§4.C `recordDeposit`); starts `PENDING`.
pub async fn record_deposit(store: &dyn Store, deposit: Deposit) -> Result<Deposit, LedgerError> {
    Ok(store.record_deposit_if_new(deposit).await?)
}

/// `PENDING -> CONFIRMED` once the oracle reports enough on-chain confirmations.
pub async fn confirm_deposit(store: &dyn Store, deposit_id: &DepositId) -> Result<Deposit, LedgerError> {
    Ok(store.confirm_deposit(deposit_id).await?)
}

/// Inserts a reward entry into the same FIFO stream as deposits (§4.C `creditReward`).
pub async fn credit_reward(
    store: &dyn Store,
    user_id: &MasterAccountId,
    points: i64,
    description: &str,
    reward_type: &str,
) -> Result<Deposit, LedgerError> {
    Ok(store.credit_reward(user_id, points, description, reward_type).await?)
}

/// `true` iff the user holds a confirmed deposit funded in the given token (§4.B tier rule).
pub async fn holds_confirmed_token(store: &dyn Store, user_id: &MasterAccountId, token_address: &str) -> Result<bool, LedgerError> {
    Ok(store.has_confirmed_deposit_with_token(user_id, token_address).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use noema_model::{DepositOrigin, DepositOwner, DepositStatus, GenerationId, NotificationPlatform, Platform, ToolId};
    use noema_store::InMemoryStore;

    async fn user_with_deposits(store: &InMemoryStore, rates_and_points: &[(i64, i64)]) -> User {
        let (user, _) = store
            .find_or_create_by_platform(Platform::Telegram, "tg-1", Default::default())
            .await
            .unwrap();
        for (rate, points) in rates_and_points {
            store
                .record_deposit_if_new(Deposit {
                    id: DepositId::generate(),
                    owner: DepositOwner::Account(user.master_account_id.clone()),
                    origin: DepositOrigin::OnChainDeposit {
                        deposit_tx_hash: format!("0x{rate}{points}"),
                    },
                    token_address: "0xusdc".into(),
                    usd_value: Decimal::new(*points, 0),
                    points_credited: *points,
                    points_remaining: *points,
                    funding_rate_applied: Decimal::new(*rate, 2),
                    status: DepositStatus::Confirmed,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        store.find_user_by_id(&user.master_account_id).await.unwrap()
    }

    #[tokio::test]
    async fn quote_reports_feasibility_without_mutating() {
        let store = InMemoryStore::new();
        let user = user_with_deposits(&store, &[(5, 100)]).await;
        assert!(quote(&store, &user, 100).await.unwrap());
        assert!(!quote(&store, &user, 101).await.unwrap());
        let after = store.find_active_deposits_for_user(&user.master_account_id).await.unwrap();
        assert_eq!(after[0].points_remaining, 100);
    }

    #[tokio::test]
    async fn spend_drains_cheapest_deposit_first() {
        let store = InMemoryStore::new();
        let user = user_with_deposits(&store, &[(10, 60), (5, 60)]).await;
        let generation = noema_model::GenerationRecord::new(
            GenerationId::generate(),
            user.master_account_id.clone(),
            "comfyui",
            ToolId::new("tool-1"),
            "Flux",
            serde_json::json!({}),
            NotificationPlatform::None,
        );
        let gen_id = generation.id.clone();
        store.create_generation(generation).await.unwrap();

        let (deductions, _) = spend(&store, &user, &gen_id, 80, GenerationPatch::default()).await.unwrap();
        assert_eq!(deductions[0].funding_rate, Decimal::new(5, 2));
        assert_eq!(deductions[0].points_deducted, 60);
        assert_eq!(deductions[1].points_deducted, 20);
    }

    #[tokio::test]
    async fn spend_fails_insufficient_funds_without_partial_debit() {
        let store = InMemoryStore::new();
        let user = user_with_deposits(&store, &[(5, 50)]).await;
        let generation = noema_model::GenerationRecord::new(
            GenerationId::generate(),
            user.master_account_id.clone(),
            "comfyui",
            ToolId::new("tool-1"),
            "Flux",
            serde_json::json!({}),
            NotificationPlatform::None,
        );
        let gen_id = generation.id.clone();
        store.create_generation(generation).await.unwrap();

        let result = spend(&store, &user, &gen_id, 500, GenerationPatch::default()).await;
        assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
        let after = store.find_active_deposits_for_user(&user.master_account_id).await.unwrap();
        assert_eq!(after[0].points_remaining, 50);
    }
}
