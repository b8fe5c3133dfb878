//! Error types for the persister.

use drip_core::ErrorClass;
use drip_store::{CollectionId, OperationType, StoreError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Collection `{collection}` was invalidated by a {operation:?} event")]
    CollectionInvalidated {
        collection: String,
        operation: OperationType,
    },

    /// The log already holds entries of an earlier generation of the source.
    #[error("Log is bound to collection {log}, current collection is {current}")]
    LogGenerationMismatch { log: CollectionId, current: CollectionId },

    #[error("Entry id space exhausted within one millisecond")]
    IdSpaceExhausted,

    #[error("Writer has shut down")]
    WriterClosed,

    #[error("Persister task failed: {0}")]
    TaskFailed(String),
}

impl PersistError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PersistError::Store(e) => e.class(),
            _ => ErrorClass::Fatal,
        }
    }

    /// The saved resume token can no longer be used; the log must be
    /// rebuilt from a fresh copy.
    pub fn is_invalid_resume_token(&self) -> bool {
        matches!(self, PersistError::Store(StoreError::InvalidResumeToken(_)))
    }
}

pub type Result<T> = std::result::Result<T, PersistError>;
