//! API keys: a credential independent of wallets, pointing at the same credit pool
//! (§3 API key).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MasterAccountId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyPermission {
    Generate,
    Admin,
}

/// Only `keyPrefix` and the SHA-256 digest are stored; the secret itself never is
/// (§3: "`keyPrefix` (first chars, indexed), SHA-256 of the secret").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiKey {
    pub key_prefix: String,
    pub secret_sha256: String,
    pub master_account_id: MasterAccountId,
    pub permissions: Vec<ApiKeyPermission>,
    pub status: ApiKeyStatus,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_active(&self) -> bool {
        self.status == ApiKeyStatus::Active
    }

    pub fn has_permission(&self, permission: ApiKeyPermission) -> bool {
        self.is_active() && self.permissions.contains(&permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ApiKey {
        ApiKey {
            key_prefix: "nm_live_ab12".into(),
            secret_sha256: "f".repeat(64),
            master_account_id: MasterAccountId::parse("a".repeat(24)).unwrap(),
            permissions: vec![ApiKeyPermission::Generate],
            status: ApiKeyStatus::Active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn revoked_key_has_no_permissions() {
        let mut key = sample();
        assert!(key.has_permission(ApiKeyPermission::Generate));
        key.status = ApiKeyStatus::Revoked;
        assert!(!key.has_permission(ApiKeyPermission::Generate));
    }

    #[test]
    fn missing_permission_is_denied() {
        assert!(!sample().has_permission(ApiKeyPermission::Admin));
    }
}
