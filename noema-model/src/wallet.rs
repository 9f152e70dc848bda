//! Wallet addresses linked to a user (§3, §4.A Wallets).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub address: String,
    pub is_primary: bool,
    pub linked_at: chrono::DateTime<chrono::Utc>,
}

impl Wallet {
    pub fn new(address: impl Into<String>, is_primary: bool) -> Self {
        Self {
            address: address.into(),
            is_primary,
            linked_at: chrono::Utc::now(),
        }
    }
}

/// Invariant check used by the store before persisting a wallet list (§3: "at most one
/// marked primary"). Returns `false` if more than one wallet is primary.
pub fn at_most_one_primary(wallets: &[Wallet]) -> bool {
    wallets.iter().filter(|w| w.is_primary).count() <= 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_two_primaries() {
        let wallets = vec![
            Wallet::new("0xabc", true),
            Wallet::new("0xdef", true),
        ];
        assert!(!at_most_one_primary(&wallets));
    }

    #[test]
    fn allows_zero_or_one_primary() {
        assert!(at_most_one_primary(&[]));
        assert!(at_most_one_primary(&[Wallet::new("0xabc", true)]));
        assert!(at_most_one_primary(&[
            Wallet::new("0xabc", true),
            Wallet::new("0xdef", false)
        ]));
    }
}
