//! Pure pricing math (§4.B): `computeCostUsd -> {multiplier, platformFeeUsd, finalCostUsd,
//! totalPoints, tier, configVersion}`. No I/O, no store access; callers resolve `UserTier`
//! themselves (`noema-ledger` does this by checking for a confirmed MS2 deposit).

pub mod table;

pub use table::{PricingTable, ServiceMultiplier};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use noema_model::UserTier;

/// 1 USD = 2800 points (§4.B).
pub const POINTS_PER_USD: i64 = 2800;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub multiplier: Decimal,
    pub platform_fee_usd: Decimal,
    pub final_cost_usd: Decimal,
    pub total_points: i64,
    pub tier: UserTier,
    pub config_version: u32,
}

/// `platformFeeUsd = computeCostUsd * (multiplier - 1)`; `finalCostUsd = computeCostUsd *
/// multiplier`; points are `finalCostUsd * 2800` rounded to the nearest integer (§4.B).
pub fn quote(table: &PricingTable, service_name: &str, tier: UserTier, compute_cost_usd: Decimal) -> Quote {
    let multiplier = table.multiplier_for(service_name, tier);
    let platform_fee_usd = compute_cost_usd * (multiplier - Decimal::ONE);
    let final_cost_usd = compute_cost_usd * multiplier;
    let total_points = (final_cost_usd * Decimal::from(POINTS_PER_USD))
        .round()
        .try_into()
        .unwrap_or(i64::MAX);

    Quote {
        multiplier,
        platform_fee_usd,
        final_cost_usd,
        total_points,
        tier,
        config_version: table.version(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_tier_with_no_override_charges_cost_verbatim() {
        let table = PricingTable::new();
        let q = quote(&table, "comfyui", UserTier::Standard, Decimal::new(100, 2));
        assert_eq!(q.multiplier, Decimal::ONE);
        assert_eq!(q.platform_fee_usd, Decimal::ZERO);
        assert_eq!(q.final_cost_usd, Decimal::new(100, 2));
        assert_eq!(q.total_points, 2800);
    }

    #[test]
    fn multiplier_above_one_produces_a_platform_fee() {
        let table = PricingTable::new().with_service_multiplier(
            "dalle",
            ServiceMultiplier::flat(Decimal::new(15, 1)),
        );
        let q = quote(&table, "dalle", UserTier::Standard, Decimal::new(200, 2));
        assert_eq!(q.final_cost_usd, Decimal::new(300, 2));
        assert_eq!(q.platform_fee_usd, Decimal::new(100, 2));
        assert_eq!(q.total_points, 8400);
    }

    #[test]
    fn points_round_to_nearest_integer() {
        let table = PricingTable::new();
        let q = quote(&table, "comfyui", UserTier::Standard, Decimal::new(1, 4));
        assert_eq!(q.total_points, 0);
        let q = quote(&table, "comfyui", UserTier::Standard, Decimal::new(2, 4));
        assert_eq!(q.total_points, 1);
    }

    #[test]
    fn config_version_is_stamped_from_the_table_snapshot() {
        let v1 = PricingTable::new();
        let v2 = v1.with_service_multiplier("dalle", ServiceMultiplier::flat(Decimal::new(15, 1)));
        assert_eq!(quote(&v1, "dalle", UserTier::Standard, Decimal::ONE).config_version, 1);
        assert_eq!(quote(&v2, "dalle", UserTier::Standard, Decimal::ONE).config_version, 2);
    }
}
