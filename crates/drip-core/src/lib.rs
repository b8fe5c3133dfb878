//! # drip-core
//!
//! Ordering primitives for the Drip incremental replication protocol.
//!
//! This crate provides:
//! - [`OrderKey`]: the `(cluster_time, entry_id)` total order over change-log entries
//! - [`EntryIdGenerator`]: strictly increasing, byte-comparable entry ids
//! - Clock handles ([`Clock`], [`SystemClock`], [`ManualClock`])
//! - [`ErrorClass`], the fatal/retryable split every error type reports
//! - The ordered-stream algebra every replay is composed from
//!
//! ## Stream algebra
//!
//! ```text
//! ordered_union(A, B)      merge; B wins ties
//! ordered_subtract(A, B)   A minus equal-keyed elements of B (1:1)
//! k_way_min_merge(S*, lt)  N-way merge, equal heads emitted once
//! take(n, S), concat(S*)   prefix and chaining
//! ```
//!
//! ## Example
//!
//! ```rust
//! use drip_core::{ordered_union, ClusterTime, OrderKey};
//! use futures::stream::{self, TryStreamExt};
//!
//! let key = |t| OrderKey::lower_bound(ClusterTime::new(t, 0));
//! let a = stream::iter(vec![Ok::<_, ()>(key(1)), Ok(key(3))]);
//! let b = stream::iter(vec![Ok(key(2))]);
//!
//! let merged: Vec<OrderKey> =
//!     futures::executor::block_on(ordered_union(a, b).try_collect()).unwrap();
//! assert_eq!(merged, vec![key(1), key(2), key(3)]);
//! ```

pub mod clock;
pub mod error;
pub mod order;
pub mod stream;

pub use clock::{millis_to_datetime, Clock, ManualClock, SharedClock, SystemClock};
pub use error::ErrorClass;
pub use order::{ClusterTime, EntryId, EntryIdGenerator, OrderKey, Sequenced};
pub use stream::{concat, k_way_min_merge, ordered_subtract, ordered_union, take};
