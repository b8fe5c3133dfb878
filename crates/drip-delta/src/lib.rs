//! Update-description codec for Drip
//!
//! Translates the change feed's partial-update reports into compact patches
//! and applies patches to documents.
//!
//! # Example
//!
//! ```rust
//! use drip_delta::{apply, encode, UpdateDescription};
//! use serde_json::json;
//!
//! let desc = UpdateDescription::new().set("a.b", json!(2)).remove("c");
//! let patch = encode(&desc);
//! assert_eq!(patch.clone().into_value(), json!({"d": {"c": false}, "sa": {"i": {"b": 2}}}));
//!
//! let new_doc = apply(&json!({"a": {"b": 1}, "c": 3}), &patch).unwrap();
//! assert_eq!(new_doc, json!({"a": {"b": 2}}));
//! ```

pub mod apply;
pub mod description;
pub mod error;
pub mod patch;

pub use apply::{apply, apply_update_description};
pub use description::{PathSegment, TruncatedArray, UpdateDescription};
pub use error::{DeltaError, Result};
pub use patch::{encode, Patch};
