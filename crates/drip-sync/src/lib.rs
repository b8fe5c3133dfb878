//! # drip-sync
//!
//! The reader side of Drip.
//!
//! - [`drip_cc`] / [`drip_cc_raw`]: causally consistent snapshot of a rule's
//!   subset, plus the cluster time to replay from
//! - [`drip_cea_resume`] / [`drip_cea_start`]: replay of the Persisted Change
//!   Stream as [`CsEvent`]s relative to the subset
//!
//! ## Handoff
//!
//! ```text
//! drip_cc(rule)   -> Start { cea_cursor: B }, Batch, Batch, ...
//! drip_cea_resume(B, rule) -> Addition / Subtraction / Noop, each with the
//!                             cursor for the next call
//! ```
//!
//! Every write committed at or after `B` is in the log by the time the
//! persister catches up, so applying the copy and then the replay leaves no
//! gap.

pub mod cea;
pub mod copy;
pub mod error;
pub mod event;

pub use cea::{drip_cea_resume, drip_cea_start, CeaRule};
pub use copy::{drip_cc, drip_cc_raw, CcItem, CcResume, CopyConfig, RawCcBatch, RawCcItem};
pub use error::{Result, SyncError};
pub use event::{CsEvent, CsOp};
