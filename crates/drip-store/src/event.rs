//! Persisted Change Stream entries.
//!
//! In storage an entry is a JSON document:
//!
//! ```text
//! { _id: { ct: {t, i}, id: <ulid> },   order key
//!   w:   <epoch millis>,               wall clock
//!   o:   "i" | "u" | "d" | "n",        operation
//!   k:   <document key>,               i/u/d
//!   a:   { after image },              i/u
//!   b:   { before image },             u/d
//!   u:   { patch } }                   u, absent for full replaces
//! ```
//!
//! Entries are validated into [`PcsEvent`] on every read.

use crate::document::{Document, DocumentKey};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use drip_core::{millis_to_datetime, ClusterTime, EntryId, OrderKey, Sequenced};
use drip_delta::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation kind of a log entry, as stored in `o`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PcsKind {
    #[serde(rename = "i")]
    Insertion,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Deletion,
    #[serde(rename = "n")]
    Noop,
}

impl PcsKind {
    pub const DATA: [PcsKind; 3] = [PcsKind::Insertion, PcsKind::Update, PcsKind::Deletion];
}

#[derive(Clone, Debug, PartialEq)]
pub enum PcsOp {
    Insertion {
        key: DocumentKey,
        after: Document,
    },
    Update {
        key: DocumentKey,
        before: Document,
        after: Document,
        /// `None` when the change was a full replace.
        diff: Option<Patch>,
    },
    Deletion {
        key: DocumentKey,
        before: Document,
    },
    /// The feed advanced without a data change.
    Noop,
}

/// One entry of a Persisted Change Stream.
#[derive(Clone, Debug, PartialEq)]
pub struct PcsEvent {
    pub id: EntryId,
    pub cluster_time: ClusterTime,
    /// For data entries the wall time reported by the feed; for noops the
    /// persister's clock. Never used for ordering.
    pub wall_clock: DateTime<Utc>,
    pub op: PcsOp,
}

impl PcsEvent {
    pub fn new(
        id: EntryId,
        cluster_time: ClusterTime,
        wall_clock: DateTime<Utc>,
        op: PcsOp,
    ) -> Self {
        Self {
            id,
            cluster_time,
            wall_clock,
            op,
        }
    }

    pub fn noop(id: EntryId, cluster_time: ClusterTime, wall_clock: DateTime<Utc>) -> Self {
        Self::new(id, cluster_time, wall_clock, PcsOp::Noop)
    }

    pub fn key(&self) -> OrderKey {
        OrderKey::new(self.cluster_time, self.id)
    }

    pub fn kind(&self) -> PcsKind {
        match self.op {
            PcsOp::Insertion { .. } => PcsKind::Insertion,
            PcsOp::Update { .. } => PcsKind::Update,
            PcsOp::Deletion { .. } => PcsKind::Deletion,
            PcsOp::Noop => PcsKind::Noop,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.op, PcsOp::Noop)
    }

    pub fn document_key(&self) -> Option<&DocumentKey> {
        match &self.op {
            PcsOp::Insertion { key, .. }
            | PcsOp::Update { key, .. }
            | PcsOp::Deletion { key, .. } => Some(key),
            PcsOp::Noop => None,
        }
    }

    pub fn after(&self) -> Option<&Document> {
        match &self.op {
            PcsOp::Insertion { after, .. } | PcsOp::Update { after, .. } => Some(after),
            _ => None,
        }
    }

    pub fn before(&self) -> Option<&Document> {
        match &self.op {
            PcsOp::Update { before, .. } | PcsOp::Deletion { before, .. } => Some(before),
            _ => None,
        }
    }

    /// Render the stored document form.
    pub fn to_document(&self) -> Result<Document> {
        let mut raw = RawEntry {
            key: self.key(),
            w: self.wall_clock.timestamp_millis(),
            o: self.kind(),
            k: None,
            a: None,
            b: None,
            u: None,
        };
        match &self.op {
            PcsOp::Insertion { key, after } => {
                raw.k = Some(key.clone());
                raw.a = Some(after.clone());
            }
            PcsOp::Update {
                key,
                before,
                after,
                diff,
            } => {
                raw.k = Some(key.clone());
                raw.b = Some(before.clone());
                raw.a = Some(after.clone());
                raw.u = diff.clone();
            }
            PcsOp::Deletion { key, before } => {
                raw.k = Some(key.clone());
                raw.b = Some(before.clone());
            }
            PcsOp::Noop => {}
        }

        match serde_json::to_value(raw)? {
            Value::Object(doc) => Ok(doc),
            other => Err(StoreError::MalformedEntry(format!("entry rendered as {}", other))),
        }
    }

    /// Decode and validate a stored document.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let raw: RawEntry = serde_json::from_value(Value::Object(doc.clone()))
            .map_err(|e| StoreError::MalformedEntry(e.to_string()))?;
        let missing = |field: &str| {
            StoreError::MalformedEntry(format!(
                "`{}` entry {} has no `{}`",
                kind_code(raw.o),
                raw.key,
                field
            ))
        };
        let unexpected = |field: &str| {
            StoreError::MalformedEntry(format!(
                "`{}` entry {} must not carry `{}`",
                kind_code(raw.o),
                raw.key,
                field
            ))
        };

        let op = match raw.o {
            PcsKind::Insertion => {
                if raw.b.is_some() {
                    return Err(unexpected("b"));
                }
                if raw.u.is_some() {
                    return Err(unexpected("u"));
                }
                PcsOp::Insertion {
                    key: raw.k.clone().ok_or_else(|| missing("k"))?,
                    after: raw.a.clone().ok_or_else(|| missing("a"))?,
                }
            }
            PcsKind::Update => PcsOp::Update {
                key: raw.k.clone().ok_or_else(|| missing("k"))?,
                before: raw.b.clone().ok_or_else(|| missing("b"))?,
                after: raw.a.clone().ok_or_else(|| missing("a"))?,
                diff: raw.u.clone(),
            },
            PcsKind::Deletion => {
                if raw.a.is_some() {
                    return Err(unexpected("a"));
                }
                PcsOp::Deletion {
                    key: raw.k.clone().ok_or_else(|| missing("k"))?,
                    before: raw.b.clone().ok_or_else(|| missing("b"))?,
                }
            }
            PcsKind::Noop => {
                let carried = [
                    ("k", raw.k.is_some()),
                    ("a", raw.a.is_some()),
                    ("b", raw.b.is_some()),
                    ("u", raw.u.is_some()),
                ];
                for (field, present) in carried {
                    if present {
                        return Err(unexpected(field));
                    }
                }
                PcsOp::Noop
            }
        };

        if raw.key.entry_id == EntryId::MIN {
            return Err(StoreError::MalformedEntry(format!(
                "entry {} uses the reserved zero id",
                raw.key
            )));
        }

        Ok(PcsEvent::new(
            raw.key.entry_id,
            raw.key.cluster_time,
            millis_to_datetime(raw.w),
            op,
        ))
    }
}

impl Sequenced for PcsEvent {
    fn order_key(&self) -> OrderKey {
        self.key()
    }
}

fn kind_code(kind: PcsKind) -> &'static str {
    match kind {
        PcsKind::Insertion => "i",
        PcsKind::Update => "u",
        PcsKind::Deletion => "d",
        PcsKind::Noop => "n",
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    #[serde(rename = "_id")]
    key: OrderKey,
    w: i64,
    o: PcsKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    k: Option<DocumentKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    a: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    b: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    u: Option<Patch>,
}
