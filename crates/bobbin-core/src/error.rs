use thiserror::Error;

use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum BobbinError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} is closed")]
    Closed(String),

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("duplicate processor for job name={0}")]
    DuplicateProcessor(String),
}

impl BobbinError {
    /// Store hiccups; the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, BobbinError::Store(err) if err.is_transient())
    }
}
