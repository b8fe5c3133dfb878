//! # drip-store
//!
//! The event model of the Persisted Change Stream and the seams through which
//! Drip talks to its backing document store.
//!
//! - [`PcsEvent`]: one durable log entry, validated from its stored form
//! - [`ChangeEvent`]: one live change-feed event, validated from the feed's
//!   native JSON
//! - Cursors and identity: [`CeaCursor`], [`CcCursor`], [`CollectionId`],
//!   [`ResumeToken`], [`RetentionBoundary`]
//! - Store traits: [`SourceStore`], [`ChangeFeed`], [`LogStore`]
//! - [`MemoryStore`], an in-process implementation of every trait

pub mod change;
pub mod cursor;
pub mod document;
pub mod error;
pub mod event;
pub mod memory;
pub mod naming;
pub mod rule;
pub mod store;

pub use change::{ChangeEvent, ChangeKind, OperationType, RawChange};
pub use cursor::{CcCursor, CeaCursor, CollectionId, FeedPosition, ResumeToken, RetentionBoundary};
pub use document::{Document, DocumentKey, ID_FIELD};
pub use error::{Result, StoreError};
pub use event::{PcsEvent, PcsKind, PcsOp};
pub use memory::{MemoryStore, Write, DEFAULT_OPLOG_CAPACITY};
pub use naming::{pcs_collection, METADATA_COLLECTION, PCS_PREFIX};
pub use rule::Rule;
pub use store::{
    CausalSession, ChangeFeed, Image, LogStore, LogStream, PcsQuery, SourceStore, Store,
    WatchOptions,
};
