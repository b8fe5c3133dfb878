//! Live change-feed events.
//!
//! Feeds deliver loosely typed JSON in the store's native shape. Each event
//! is validated into a [`ChangeEvent`] as soon as it is read; nothing past
//! this module sees the raw form.

use crate::cursor::ResumeToken;
use crate::document::{Document, DocumentKey, ID_FIELD};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use drip_core::{millis_to_datetime, ClusterTime};
use drip_delta::UpdateDescription;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,
    Invalidate,
}

impl OperationType {
    /// Operations that change document contents.
    pub const DATA: [OperationType; 4] = [
        OperationType::Insert,
        OperationType::Update,
        OperationType::Replace,
        OperationType::Delete,
    ];

    pub fn is_data(&self) -> bool {
        Self::DATA.contains(self)
    }
}

/// Native wire shape of a change-feed event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChange {
    #[serde(rename = "_id")]
    pub token: ResumeToken,
    pub operation_type: OperationType,
    pub cluster_time: ClusterTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document_before_change: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChangeKind {
    Insert {
        key: DocumentKey,
        after: Document,
    },
    Update {
        key: DocumentKey,
        before: Document,
        after: Document,
        description: UpdateDescription,
    },
    Replace {
        key: DocumentKey,
        before: Document,
        after: Document,
    },
    Delete {
        key: DocumentKey,
        before: Document,
    },
    /// The watched collection went away (drop, rename, database drop).
    Invalidate { operation: OperationType },
}

/// A validated change-feed event.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub token: ResumeToken,
    pub cluster_time: ClusterTime,
    pub wall_clock: DateTime<Utc>,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    /// Validate a raw feed event.
    pub fn from_raw(raw: Value) -> Result<Self> {
        let raw: RawChange =
            serde_json::from_value(raw).map_err(|e| StoreError::MalformedChange(e.to_string()))?;
        let op = raw.operation_type;

        let kind = match op {
            OperationType::Insert => {
                let after = image(raw.full_document, op, "fullDocument")?;
                ChangeKind::Insert {
                    key: checked_key(raw.document_key.as_ref(), &after, op)?,
                    after,
                }
            }
            OperationType::Update => {
                let before =
                    image(raw.full_document_before_change, op, "fullDocumentBeforeChange")?;
                let after = image(raw.full_document, op, "fullDocument")?;
                ChangeKind::Update {
                    key: checked_key(raw.document_key.as_ref(), &after, op)?,
                    description: raw
                        .update_description
                        .ok_or_else(|| malformed(op, "updateDescription"))?,
                    before,
                    after,
                }
            }
            OperationType::Replace => {
                let before =
                    image(raw.full_document_before_change, op, "fullDocumentBeforeChange")?;
                let after = image(raw.full_document, op, "fullDocument")?;
                ChangeKind::Replace {
                    key: checked_key(raw.document_key.as_ref(), &after, op)?,
                    before,
                    after,
                }
            }
            OperationType::Delete => {
                let before =
                    image(raw.full_document_before_change, op, "fullDocumentBeforeChange")?;
                ChangeKind::Delete {
                    key: checked_key(raw.document_key.as_ref(), &before, op)?,
                    before,
                }
            }
            OperationType::Drop
            | OperationType::Rename
            | OperationType::DropDatabase
            | OperationType::Invalidate => ChangeKind::Invalidate { operation: op },
        };

        let wall_time = match (&kind, raw.wall_time) {
            (_, Some(ms)) => ms,
            (ChangeKind::Invalidate { .. }, None) => 0,
            (_, None) => return Err(malformed(op, "wallTime")),
        };

        Ok(ChangeEvent {
            token: raw.token,
            cluster_time: raw.cluster_time,
            wall_clock: millis_to_datetime(wall_time),
            kind,
        })
    }

    pub fn is_invalidate(&self) -> bool {
        matches!(self.kind, ChangeKind::Invalidate { .. })
    }
}

fn malformed(op: OperationType, field: &str) -> StoreError {
    StoreError::MalformedChange(format!("{:?} event has no `{}`", op, field))
}

fn image(doc: Option<Document>, op: OperationType, field: &str) -> Result<Document> {
    doc.ok_or_else(|| malformed(op, field))
}

/// The event's `documentKey` must agree with the image it describes.
fn checked_key(
    document_key: Option<&Document>,
    image: &Document,
    op: OperationType,
) -> Result<DocumentKey> {
    let reported = document_key
        .and_then(|k| k.get(ID_FIELD))
        .ok_or_else(|| malformed(op, "documentKey._id"))?;
    let key = DocumentKey::from_value(reported)
        .map_err(|e| StoreError::MalformedChange(e.to_string()))?;
    match image.get(ID_FIELD).map(DocumentKey::from_value) {
        Some(Ok(image_key)) if image_key == key => Ok(key),
        _ => Err(StoreError::MalformedChange(format!(
            "{:?} event image does not belong to document {}",
            op, key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_update() {
        let event = ChangeEvent::from_raw(json!({
            "_id": "0000000000000007",
            "operationType": "update",
            "clusterTime": {"t": 10, "i": 1},
            "wallTime": 1_000,
            "documentKey": {"_id": 1},
            "fullDocumentBeforeChange": {"_id": 1, "a": 0},
            "fullDocument": {"_id": 1, "a": 1},
            "updateDescription": {
                "updatedFields": {"a": 1},
                "removedFields": [],
                "truncatedArrays": []
            }
        }))
        .unwrap();
        assert_eq!(event.cluster_time, ClusterTime::new(10, 1));
        assert_eq!(event.wall_clock.timestamp_millis(), 1_000);
        assert!(matches!(
            event.kind,
            ChangeKind::Update { ref key, .. } if *key == DocumentKey::from(1i64)
        ));
    }

    #[test]
    fn test_update_without_before_image_is_malformed() {
        let err = ChangeEvent::from_raw(json!({
            "_id": "t",
            "operationType": "update",
            "clusterTime": {"t": 10, "i": 1},
            "wallTime": 1_000,
            "documentKey": {"_id": 1},
            "fullDocument": {"_id": 1, "a": 1},
            "updateDescription": {}
        }))
        .unwrap_err();
        assert!(matches!(err, StoreError::MalformedChange(_)));
    }

    #[test]
    fn test_key_must_match_image() {
        let err = ChangeEvent::from_raw(json!({
            "_id": "t",
            "operationType": "insert",
            "clusterTime": {"t": 1, "i": 1},
            "wallTime": 5,
            "documentKey": {"_id": 1},
            "fullDocument": {"_id": 2}
        }))
        .unwrap_err();
        assert!(matches!(err, StoreError::MalformedChange(_)));
    }

    #[test]
    fn test_drop_is_invalidate() {
        let event = ChangeEvent::from_raw(json!({
            "_id": "t",
            "operationType": "drop",
            "clusterTime": {"t": 1, "i": 1}
        }))
        .unwrap();
        assert!(event.is_invalidate());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            ChangeEvent::from_raw(json!({"operationType": "insert"})),
            Err(StoreError::MalformedChange(_))
        ));
    }
}
