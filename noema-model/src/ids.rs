//! Opaque identifiers used across the store, ledger, and lifecycle engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 24-hex-character account id (§3 User). Validated at construction so every other
/// crate can treat it as already well-formed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MasterAccountId(String);

/// A master account id was not 24 lowercase hex characters.
#[derive(Debug, thiserror::Error)]
#[error("invalid masterAccountId {0:?}: expected 24 hex characters")]
pub struct InvalidMasterAccountId(String);

impl MasterAccountId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidMasterAccountId> {
        let raw = raw.into();
        if raw.len() == 24 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(raw.to_ascii_lowercase()))
        } else {
            Err(InvalidMasterAccountId(raw))
        }
    }

    /// Synthetic id for an x402 micropayment caller (§4.I): `x402:<payerAddress>`. Not
    /// 24-hex, so it bypasses `parse` and is only ever constructed here.
    pub fn x402(payer_address: &str) -> Self {
        Self(format!("x402:{}", payer_address.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_x402(&self) -> bool {
        self.0.starts_with("x402:")
    }
}

impl fmt::Display for MasterAccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(GenerationId);
string_id!(DepositId);
string_id!(CookId);
string_id!(SpellCastId);
string_id!(ToolId);
string_id!(RunId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_hex() {
        let id = MasterAccountId::parse("aaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        assert_eq!(id.as_str(), "aaaaaaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(MasterAccountId::parse("abc").is_err());
    }

    #[test]
    fn parse_rejects_non_hex() {
        assert!(MasterAccountId::parse("zzzzzzzzzzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn x402_id_is_tagged() {
        let id = MasterAccountId::x402("0xABCDEF");
        assert!(id.is_x402());
        assert_eq!(id.as_str(), "x402:0xabcdef");
    }
}
