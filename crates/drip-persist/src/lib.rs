//! # drip-persist
//!
//! Turns the live change feed of one source collection into its Persisted
//! Change Stream.
//!
//! - [`run_persister`] / [`Persister`]: the feed loop, with noop spacing
//! - [`FlushBuffer`]: coalesces pushes into batch writes
//! - [`WriteSequencer`]: the single writer of a log; batches never reorder
//!
//! ## Example
//!
//! ```rust,no_run
//! use drip_persist::{run_persister, PersisterConfigBuilder};
//! use drip_store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn demo() -> drip_persist::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let config = PersisterConfigBuilder::new().max_batch_size(50).max_await(200).build();
//! let handle = run_persister(store, "orders", config);
//! // ...
//! let summary = handle.stop().await?;
//! println!("persisted {} events", summary.events_written);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod persister;
pub mod sequencer;

pub use buffer::FlushBuffer;
pub use config::{PersisterConfig, PersisterConfigBuilder};
pub use error::{PersistError, Result};
pub use persister::{
    run_persister, NoopCandidate, NoopDecision, NoopTracker, Persister, PersisterHandle,
    PersisterSummary,
};
pub use sequencer::{WriteBatch, WriteSequencer, WriterStats};
