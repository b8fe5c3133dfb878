//! Error types for the update-description codec.

use drip_core::ErrorClass;
use thiserror::Error;

/// Errors raised while decoding or applying a patch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeltaError {
    #[error("Invalid update description at `{path}`: {reason}")]
    InvalidUpdateDescription { path: String, reason: String },
}

impl DeltaError {
    /// A malformed patch never becomes valid on retry.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }

    pub(crate) fn invalid(path: &str, reason: impl Into<String>) -> Self {
        DeltaError::InvalidUpdateDescription {
            path: if path.is_empty() { "<root>".to_string() } else { path.to_string() },
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeltaError>;
