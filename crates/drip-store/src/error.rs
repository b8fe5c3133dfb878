//! Error types for the store layer.

use drip_core::ErrorClass;
use drip_delta::DeltaError;
use thiserror::Error;

/// Errors raised by store implementations and by decoding what they return.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Invalid resume token: {0}")]
    InvalidResumeToken(String),

    #[error("Malformed change event: {0}")]
    MalformedChange(String),

    #[error("Malformed log entry: {0}")]
    MalformedEntry(String),

    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Change feed cursor was killed")]
    CursorKilled,

    #[error("Transient store error: {0}")]
    Transient(String),

    #[error(transparent)]
    Delta(#[from] DeltaError),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Transient(_) => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::MalformedDocument(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
