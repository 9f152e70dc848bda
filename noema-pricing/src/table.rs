//! Versioned multiplier table (§4.B). Changes produce a new table with a bumped version
//! instead of mutating in place, so a generation's stamped `configVersion` always points at
//! an immutable snapshot.

use std::collections::HashMap;

use rust_decimal::Decimal;

use noema_model::UserTier;

/// Multiplier for one service: a default, plus overrides for specific tiers.
#[derive(Clone, Debug)]
pub struct ServiceMultiplier {
    pub default: Decimal,
    pub tier_overrides: HashMap<UserTier, Decimal>,
}

impl ServiceMultiplier {
    pub fn flat(default: Decimal) -> Self {
        Self {
            default,
            tier_overrides: HashMap::new(),
        }
    }

    fn for_tier(&self, tier: UserTier) -> Decimal {
        self.tier_overrides.get(&tier).copied().unwrap_or(self.default)
    }
}

#[derive(Clone, Debug)]
pub struct PricingTable {
    version: u32,
    entries: HashMap<String, ServiceMultiplier>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            version: 1,
            entries: HashMap::new(),
        }
    }
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Multiplier applied for `service_name` at `tier`; services with no entry default to
    /// 1.0 (§4.B: "default 1.0").
    pub fn multiplier_for(&self, service_name: &str, tier: UserTier) -> Decimal {
        self.entries
            .get(service_name)
            .map(|m| m.for_tier(tier))
            .unwrap_or(Decimal::ONE)
    }

    /// Returns a new table, one version ahead, with `service_name`'s multiplier replaced.
    /// The old table is left untouched (§4.B: "never mutate in place").
    pub fn with_service_multiplier(&self, service_name: impl Into<String>, multiplier: ServiceMultiplier) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(service_name.into(), multiplier);
        Self {
            version: self.version + 1,
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_service_defaults_to_one() {
        let table = PricingTable::new();
        assert_eq!(table.multiplier_for("comfyui", UserTier::Standard), Decimal::ONE);
    }

    #[test]
    fn tier_override_applies_over_default() {
        let mut overrides = HashMap::new();
        overrides.insert(UserTier::Ms2, Decimal::new(8, 1));
        let table = PricingTable::new()
            .with_service_multiplier("comfyui", ServiceMultiplier { default: Decimal::new(12, 1), tier_overrides: overrides });
        assert_eq!(table.multiplier_for("comfyui", UserTier::Standard), Decimal::new(12, 1));
        assert_eq!(table.multiplier_for("comfyui", UserTier::Ms2), Decimal::new(8, 1));
    }

    #[test]
    fn replacing_a_multiplier_bumps_version_and_leaves_old_table_intact() {
        let v1 = PricingTable::new();
        let v2 = v1.with_service_multiplier("dalle", ServiceMultiplier::flat(Decimal::new(15, 1)));
        assert_eq!(v1.version(), 1);
        assert_eq!(v2.version(), 2);
        assert_eq!(v1.multiplier_for("dalle", UserTier::Standard), Decimal::ONE);
    }
}
