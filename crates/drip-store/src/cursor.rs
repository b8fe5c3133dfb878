//! Cursors, tokens and collection identity.
//!
//! Cursors are plain values. Every emission produces a new one; nothing is
//! advanced in place.

use crate::document::DocumentKey;
use chrono::{DateTime, Utc};
use drip_core::{ClusterTime, OrderKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identity of one generation of a source collection.
///
/// Minted when the collection is created; a drop followed by a re-create
/// yields a different id, which is how stale cursors are detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(Ulid);

impl CollectionId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exclusive lower bound into a Persisted Change Stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CeaCursor {
    pub collection_id: CollectionId,
    pub key: OrderKey,
}

impl CeaCursor {
    pub fn new(collection_id: CollectionId, key: OrderKey) -> Self {
        Self { collection_id, key }
    }

    /// Cursor positioned before every entry committed at `cluster_time`.
    pub fn at_cluster_time(collection_id: CollectionId, cluster_time: ClusterTime) -> Self {
        Self::new(collection_id, OrderKey::lower_bound(cluster_time))
    }
}

impl fmt::Display for CeaCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.collection_id, self.key)
    }
}

/// Resume point of a collection copy.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CcCursor {
    pub collection_id: CollectionId,
    /// Key of the last copied document, `None` before the first batch.
    pub last_key: Option<DocumentKey>,
}

impl CcCursor {
    pub fn new(collection_id: CollectionId) -> Self {
        Self {
            collection_id,
            last_key: None,
        }
    }

    pub fn advanced_to(&self, last_key: DocumentKey) -> Self {
        Self {
            collection_id: self.collection_id,
            last_key: Some(last_key),
        }
    }
}

/// Opaque change-feed resume token.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a change feed currently stands, whether or not it delivered data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPosition {
    pub token: ResumeToken,
    pub cluster_time: ClusterTime,
}

/// The last entry removed from a log by cleanup.
///
/// Retention always cuts a contiguous prefix, so every key at or before
/// `key` is gone and every key after it is still present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionBoundary {
    pub key: OrderKey,
    pub wall_clock: DateTime<Utc>,
}

impl RetentionBoundary {
    /// Whether a cursor at `key` points into the removed prefix.
    pub fn covers(&self, key: &OrderKey) -> bool {
        *key <= self.key
    }
}
