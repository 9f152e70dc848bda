//! Ledger entries: deposits and rewards drawn from the same FIFO stream (§3 Deposit,
//! Reward entry).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{DepositId, MasterAccountId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DepositStatus {
    Pending,
    Confirmed,
    Exhausted,
    Refunded,
}

/// Owner of a deposit: either a linked account, or a raw depositor address for deposits
/// made before wallet linking (§4.C `spend`: "wallet only if user-set is empty").
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositOwner {
    Account(MasterAccountId),
    DepositorAddress(String),
}

/// A reward is drawn from the same FIFO stream as a deposit but carries no tx hash and is
/// tagged with a reward type instead (§3 Reward entry).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositOrigin {
    /// On-chain deposit; `depositTxHash` doubles as the idempotency key.
    OnChainDeposit { deposit_tx_hash: String },
    Reward { reward_type: String, description: String },
}

/// Immutable-after-confirmation ledger entry. See §3 invariants:
/// `0 ≤ pointsRemaining ≤ pointsCredited`; `status = EXHAUSTED ⇒ pointsRemaining = 0`;
/// `depositTxHash` globally unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deposit {
    pub id: DepositId,
    pub owner: DepositOwner,
    pub origin: DepositOrigin,
    pub token_address: String,
    pub usd_value: Decimal,
    pub points_credited: i64,
    pub points_remaining: i64,
    /// Fee rate the depositor paid; used for FIFO debit ordering (cheapest first, §4.C).
    pub funding_rate_applied: Decimal,
    pub status: DepositStatus,
    pub created_at: DateTime<Utc>,
}

impl Deposit {
    /// `true` once the deposit invariants in §3 hold; used defensively in tests and by the
    /// store before a commit.
    pub fn invariants_hold(&self) -> bool {
        self.points_remaining >= 0
            && self.points_remaining <= self.points_credited
            && (self.status != DepositStatus::Exhausted || self.points_remaining == 0)
    }

    pub fn deposit_tx_hash(&self) -> Option<&str> {
        match &self.origin {
            DepositOrigin::OnChainDeposit { deposit_tx_hash } => Some(deposit_tx_hash),
            DepositOrigin::Reward { .. } => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == DepositStatus::Confirmed && self.points_remaining > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(points_remaining: i64, status: DepositStatus) -> Deposit {
        Deposit {
            id: DepositId::generate(),
            owner: DepositOwner::Account(MasterAccountId::parse("a".repeat(24)).unwrap()),
            origin: DepositOrigin::OnChainDeposit {
                deposit_tx_hash: "0xhash".into(),
            },
            token_address: "0xusdc".into(),
            usd_value: Decimal::new(100, 2),
            points_credited: 2800,
            points_remaining,
            funding_rate_applied: Decimal::new(5, 2),
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn exhausted_must_have_zero_remaining() {
        assert!(sample(0, DepositStatus::Exhausted).invariants_hold());
        assert!(!sample(10, DepositStatus::Exhausted).invariants_hold());
    }

    #[test]
    fn remaining_cannot_exceed_credited() {
        let mut d = sample(2800, DepositStatus::Confirmed);
        assert!(d.invariants_hold());
        d.points_remaining = 3000;
        assert!(!d.invariants_hold());
    }

    #[test]
    fn is_active_requires_confirmed_and_positive_remaining() {
        assert!(sample(100, DepositStatus::Confirmed).is_active());
        assert!(!sample(0, DepositStatus::Confirmed).is_active());
        assert!(!sample(100, DepositStatus::Pending).is_active());
    }
}
