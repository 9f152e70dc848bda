//! Errors surfaced by the lifecycle engine, always mappable onto a stable [`ErrorKind`]
//! (§7) so the gateway can translate without knowing which subsystem failed.

use noema_model::{ErrorKind, NoemaError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("insufficient funds: need {needed} points")]
    InsufficientFunds { needed: i64 },
    #[error("no runtime registered for service {0:?}")]
    UnsupportedService(noema_model::Service),
    #[error("runtime error: {0}")]
    Runtime(#[from] noema_runtimes::RuntimeError),
    #[error(transparent)]
    Storage(#[from] noema_store::StoreError),
    #[error(transparent)]
    Ledger(#[from] noema_ledger::LedgerError),
    #[error("cost settlement failed: {0}")]
    CostSettlementFailed(String),
}

impl From<&LifecycleError> for NoemaError {
    fn from(err: &LifecycleError) -> Self {
        let kind = match err {
            LifecycleError::ToolNotFound(_) => ErrorKind::NotFound,
            LifecycleError::InvalidInput(_) => ErrorKind::InvalidInput,
            LifecycleError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LifecycleError::UnsupportedService(_) => ErrorKind::InvalidInput,
            LifecycleError::Runtime(_) => ErrorKind::UpstreamFailed,
            LifecycleError::Storage(_) => ErrorKind::StorageUnavailable,
            LifecycleError::Ledger(_) => ErrorKind::InsufficientFunds,
            LifecycleError::CostSettlementFailed(_) => ErrorKind::CostSettlementFailed,
        };
        NoemaError::new(kind, err.to_string())
    }
}
