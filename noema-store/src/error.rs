//! Storage-layer errors. Every operation maps onto one of these three (§4.A).

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(e.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<StoreError> for noema_model::NoemaError {
    fn from(e: StoreError) -> Self {
        use noema_model::ErrorKind;
        match e {
            StoreError::NotFound(m) => noema_model::NoemaError::new(ErrorKind::NotFound, m),
            StoreError::Conflict(m) => noema_model::NoemaError::new(ErrorKind::Conflict, m),
            StoreError::Unavailable(m) => {
                noema_model::NoemaError::new(ErrorKind::StorageUnavailable, m)
            }
        }
    }
}
