//! Error types for copy and replay.

use drip_core::{ErrorClass, OrderKey};
use drip_store::{CollectionId, StoreError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The log no longer reaches back to the cursor.
    #[error("CEA cursor {cursor} is not retained (boundary {boundary})")]
    CeaCursorNotFound { cursor: OrderKey, boundary: OrderKey },

    /// The source was dropped or recreated since the cursor was issued or
    /// since its log was written. `expected` is the generation the cursor or
    /// log belongs to.
    #[error("Expected collection {expected}, current collection is {}", describe(.found))]
    CollectionMismatch {
        expected: CollectionId,
        found: Option<CollectionId>,
    },

    #[error("Failed to serialize batch: {0}")]
    Serialization(String),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Store(e) => e.class(),
            _ => ErrorClass::Fatal,
        }
    }

    /// The caller has to bootstrap again with a collection copy.
    pub fn requires_copy(&self) -> bool {
        matches!(
            self,
            SyncError::CeaCursorNotFound { .. } | SyncError::CollectionMismatch { .. }
        )
    }
}

fn describe(found: &Option<CollectionId>) -> String {
    match found {
        Some(id) => id.to_string(),
        None => "missing".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
