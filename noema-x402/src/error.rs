use thiserror::Error;

use noema_model::{ErrorKind, NoemaError};

#[derive(Debug, Error)]
pub enum X402Error {
    #[error("payment verification failed: {0}")]
    VerificationFailed(String),
    #[error("payment authorization nonce already used")]
    AlreadyUsed,
    #[error("facilitator request failed: {0}")]
    Facilitator(String),
    #[error(transparent)]
    Lifecycle(#[from] noema_lifecycle::LifecycleError),
    #[error(transparent)]
    Storage(#[from] noema_store::StoreError),
}

impl From<&X402Error> for NoemaError {
    fn from(err: &X402Error) -> Self {
        let kind = match err {
            X402Error::VerificationFailed(_) => ErrorKind::Unauthorized,
            X402Error::AlreadyUsed => ErrorKind::PaymentAlreadyUsed,
            X402Error::Facilitator(_) => ErrorKind::UpstreamFailed,
            X402Error::Lifecycle(e) => return e.into(),
            X402Error::Storage(_) => ErrorKind::StorageUnavailable,
        };
        NoemaError::new(kind, err.to_string())
    }
}
