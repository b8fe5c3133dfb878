//! Source documents and their natural keys.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A source document. Always a JSON object carrying an `_id`.
pub type Document = Map<String, Value>;

/// Field holding a document's natural key.
pub const ID_FIELD: &str = "_id";

/// The natural key `_id` of a source document.
///
/// Integer keys sort before string keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentKey {
    Int(i64),
    Str(String),
}

impl DocumentKey {
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(DocumentKey::Int)
                .ok_or_else(|| {
                    StoreError::MalformedDocument(format!(
                        "`_id` must be an integer or a string, found {}",
                        n
                    ))
                }),
            Value::String(s) => Ok(DocumentKey::Str(s.clone())),
            other => Err(StoreError::MalformedDocument(format!(
                "`_id` must be an integer or a string, found {}",
                other
            ))),
        }
    }

    /// The key of `doc`.
    pub fn of(doc: &Document) -> Result<Self> {
        doc.get(ID_FIELD)
            .ok_or_else(|| StoreError::MalformedDocument("document has no `_id`".into()))
            .and_then(Self::from_value)
    }

    pub fn to_value(&self) -> Value {
        match self {
            DocumentKey::Int(n) => Value::from(*n),
            DocumentKey::Str(s) => Value::String(s.clone()),
        }
    }
}

impl From<i64> for DocumentKey {
    fn from(n: i64) -> Self {
        DocumentKey::Int(n)
    }
}

impl From<&str> for DocumentKey {
    fn from(s: &str) -> Self {
        DocumentKey::Str(s.to_string())
    }
}

impl From<String> for DocumentKey {
    fn from(s: String) -> Self {
        DocumentKey::Str(s)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKey::Int(n) => write!(f, "{}", n),
            DocumentKey::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Validate that `value` is a document with a usable key.
pub fn into_document(value: Value) -> Result<(DocumentKey, Document)> {
    match value {
        Value::Object(doc) => {
            let key = DocumentKey::of(&doc)?;
            Ok((key, doc))
        }
        other => Err(StoreError::MalformedDocument(format!(
            "expected an object, found {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integers_sort_before_strings() {
        let mut keys = vec![
            DocumentKey::from("b"),
            DocumentKey::from(10i64),
            DocumentKey::from("a"),
            DocumentKey::from(-3),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                DocumentKey::from(-3),
                DocumentKey::from(10i64),
                DocumentKey::from("a"),
                DocumentKey::from("b"),
            ]
        );
    }

    #[test]
    fn test_key_of_document() {
        let (key, _) = into_document(json!({"_id": "x", "v": 1})).unwrap();
        assert_eq!(key, DocumentKey::from("x"));

        assert!(into_document(json!({"v": 1})).is_err());
        assert!(into_document(json!({"_id": 1.5})).is_err());
        assert!(into_document(json!([1])).is_err());
    }

    #[test]
    fn test_key_serializes_untagged() {
        assert_eq!(serde_json::to_value(DocumentKey::from(7i64)).unwrap(), json!(7));
        assert_eq!(serde_json::to_value(DocumentKey::from("k")).unwrap(), json!("k"));
        let back: DocumentKey = serde_json::from_value(json!("k")).unwrap();
        assert_eq!(back, DocumentKey::from("k"));
    }
}
