//! Builds the `X-PAYMENT-REQUIRED` challenge body (§4.I step 1, §6 x402 routes).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// USDC has 6 decimal places; amounts in a payment requirement are atomic units.
const USDC_DECIMALS: u32 = 6;

pub const DEFAULT_NETWORK: &str = "eip155:8453";
pub const DEFAULT_SCHEME: &str = "exact";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub scheme: String,
    pub network: String,
    pub asset: String,
    /// Atomic units of `asset`, as a decimal string (EIP-3009 authorizations are unsigned
    /// integers, not floats).
    pub amount: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct X402Challenge {
    pub accepts: Vec<PaymentRequirement>,
}

fn usd_to_atomic_usdc(amount_usd: Decimal) -> u64 {
    let atomic = amount_usd * Decimal::from(10u64.pow(USDC_DECIMALS));
    atomic.round().try_into().unwrap_or(u64::MAX)
}

/// One `accepts` entry, quoted against `final_cost_usd` (§4.I: "computed from Pricing's
/// quote").
pub fn build_challenge(final_cost_usd: Decimal, asset: &str, pay_to: &str, max_timeout_seconds: u64) -> X402Challenge {
    X402Challenge {
        accepts: vec![PaymentRequirement {
            scheme: DEFAULT_SCHEME.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            asset: asset.to_string(),
            amount: usd_to_atomic_usdc(final_cost_usd).to_string(),
            pay_to: pay_to.to_string(),
            max_timeout_seconds,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_usd_to_atomic_usdc_units() {
        // Scenario 4 in the testable-properties: $0.044 -> 44000 atomic units.
        let challenge = build_challenge(Decimal::new(44, 3), "0xusdc", "0xpayto", 120);
        assert_eq!(challenge.accepts[0].amount, "44000");
    }

    #[test]
    fn challenge_carries_the_fixed_network_and_scheme() {
        let challenge = build_challenge(Decimal::ONE, "0xusdc", "0xpayto", 60);
        assert_eq!(challenge.accepts[0].network, DEFAULT_NETWORK);
        assert_eq!(challenge.accepts[0].scheme, DEFAULT_SCHEME);
        assert_eq!(challenge.accepts[0].max_timeout_seconds, 60);
    }
}
