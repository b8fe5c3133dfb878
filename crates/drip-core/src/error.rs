//! Error classification shared by every Drip crate.

use std::fmt;

/// Whether an error may succeed if the caller simply tries again.
///
/// Drip never retries internally; callers own the policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The caller must re-bootstrap or fix its input.
    Fatal,
    /// A transient failure of the backing store.
    Retryable,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Retryable)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::Retryable => write!(f, "retryable"),
        }
    }
}
