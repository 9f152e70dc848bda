//! Stable error kinds shared across transports (§7). Every crate in the workspace maps its
//! internal errors onto one of these so the gateway can translate to HTTP/JSON-RPC without
//! knowing which subsystem failed.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Unauthorized,
    InsufficientFunds,
    PaymentRequired,
    PaymentAlreadyUsed,
    RateLimited,
    UpstreamFailed,
    Timeout,
    CostSettlementFailed,
    StorageUnavailable,
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::PaymentRequired => "PAYMENT_REQUIRED",
            ErrorKind::PaymentAlreadyUsed => "PAYMENT_ALREADY_USED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::UpstreamFailed => "UPSTREAM_FAILED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::CostSettlementFailed => "COST_SETTLEMENT_FAILED",
            ErrorKind::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorKind::Conflict => "CONFLICT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{code, message}` surfaced on a generation record and at the gateway boundary (§7); never
/// a raw stack trace.
#[derive(Clone, Debug, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct NoemaError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NoemaError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn insufficient_funds(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InsufficientFunds, message)
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageUnavailable, message)
    }
}
