//! Errors raised while expiring log entries.

use drip_core::ErrorClass;
use drip_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Cleaner task failed: {0}")]
    TaskFailed(String),
}

impl CompactionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CompactionError::Store(e) => e.class(),
            CompactionError::TaskFailed(_) => ErrorClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompactionError>;
