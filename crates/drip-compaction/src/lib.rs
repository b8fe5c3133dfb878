//! # drip-compaction
//!
//! Retention for Persisted Change Streams.
//!
//! - [`expire_pcs_events`]: one atomic prefix cut, never touching the newest
//!   entry
//! - [`spawn_cleaner`]: runs the cut periodically under a [`RetentionPolicy`]
//!
//! A CEA cursor at or before the recorded retention boundary can no longer
//! be resumed; the reader has to bootstrap again through a collection copy.

mod cleaner;
mod error;
mod retention;

pub use cleaner::{expire_pcs_events, CleanupOutcome};
pub use error::{CompactionError, Result};
pub use retention::{spawn_cleaner, CleanerHandle, CleanerStats, RetentionPolicy};
