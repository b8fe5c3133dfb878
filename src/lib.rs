//! # Drip
//!
//! Incremental, causally consistent replication of a subset of a document
//! collection.
//!
//! A [`persist`] task turns the live change feed of a collection into a
//! durable, ordered log (the Persisted Change Stream). A reader bootstraps
//! with a collection copy from [`sync`], then replays the log from the copy's
//! cluster time as additions, subtractions and noops relative to its own
//! filter. [`compaction`] trims the log without ever stranding a valid
//! cursor.
//!
//! | Crate             | Role                                          |
//! |-------------------|-----------------------------------------------|
//! | [`core`]          | cluster time, entry ids, order keys, streams  |
//! | [`delta`]         | update-description codec                      |
//! | [`store`]         | log model, store traits, in-memory store      |
//! | [`persist`]       | persister, flush buffer, write sequencer      |
//! | [`compaction`]    | cleaner and retention task                    |
//! | [`sync`]          | collection copy and change event application  |

pub use drip_compaction as compaction;
pub use drip_core as core;
pub use drip_delta as delta;
pub use drip_persist as persist;
pub use drip_store as store;
pub use drip_sync as sync;

/// The names most callers need.
pub mod prelude {
    pub use drip_compaction::{expire_pcs_events, spawn_cleaner, CleanupOutcome, RetentionPolicy};
    pub use drip_core::{ClusterTime, EntryId, ErrorClass, OrderKey};
    pub use drip_delta::{apply, apply_update_description, encode, Patch, UpdateDescription};
    pub use drip_persist::{run_persister, PersisterConfig, PersisterConfigBuilder, PersisterHandle};
    pub use drip_store::{CeaCursor, CcCursor, DocumentKey, MemoryStore, PcsEvent, Rule, Store};
    pub use drip_sync::{
        drip_cc, drip_cc_raw, drip_cea_resume, drip_cea_start, CcItem, CeaRule, CopyConfig, CsEvent,
        CsOp,
    };
}
