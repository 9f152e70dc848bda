use thiserror::Error;

use noema_model::{ErrorKind, NoemaError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cook {0} is not in a startable state")]
    NotStartable(String),
    #[error(transparent)]
    Storage(#[from] noema_store::StoreError),
    #[error(transparent)]
    Lifecycle(#[from] noema_lifecycle::LifecycleError),
    #[error(transparent)]
    Graph(#[from] noema_model::SpellGraphError),
}

impl From<&SchedulerError> for NoemaError {
    fn from(err: &SchedulerError) -> Self {
        let kind = match err {
            SchedulerError::NotStartable(_) => ErrorKind::Conflict,
            SchedulerError::Storage(e) => {
                let kind = match e {
                    noema_store::StoreError::NotFound(_) => ErrorKind::NotFound,
                    noema_store::StoreError::Conflict(_) => ErrorKind::Conflict,
                    noema_store::StoreError::Unavailable(_) => ErrorKind::StorageUnavailable,
                };
                return NoemaError::new(kind, e.to_string());
            }
            SchedulerError::Lifecycle(e) => return e.into(),
            SchedulerError::Graph(_) => ErrorKind::InvalidInput,
        };
        NoemaError::new(kind, err.to_string())
    }
}
