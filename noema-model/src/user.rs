//! User aggregate (§3 User).

use serde::{Deserialize, Serialize};

use crate::ids::MasterAccountId;
use crate::wallet::Wallet;

/// Chat/web surface a user first contacted us through, or cast a request from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Discord,
    Web,
}

/// `(platform, platformId)` pair identifying a user on one external surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformIdentity {
    pub platform: Platform,
    pub platform_id: String,
}

/// Pricing tier derived from ledger state (§4.B): `ms2` iff the user holds a confirmed
/// deposit funded in the MS2 token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    Standard,
    Ms2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Suspended,
}

/// A user, identified by an opaque 24-hex `masterAccountId`. Created on first contact,
/// never deleted (soft `status` field only).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub master_account_id: MasterAccountId,
    pub display_name: Option<String>,
    pub identities: Vec<PlatformIdentity>,
    pub wallets: Vec<Wallet>,
    pub status: UserStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl User {
    pub fn new(master_account_id: MasterAccountId, identity: PlatformIdentity) -> Self {
        Self {
            master_account_id,
            display_name: None,
            identities: vec![identity],
            wallets: Vec::new(),
            status: UserStatus::Active,
            created_at: chrono::Utc::now(),
        }
    }

    /// The wallet marked primary, if the user has linked any (§3: "at most one marked
    /// primary").
    pub fn primary_wallet(&self) -> Option<&Wallet> {
        self.wallets.iter().find(|w| w.is_primary)
    }
}
