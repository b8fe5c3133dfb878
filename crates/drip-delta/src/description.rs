//! Store-native update descriptions.
//!
//! This is the shape in which the change feed reports a partial update:
//! removed paths, truncated arrays and updated paths, each written as a dotted
//! path. Dotted paths are ambiguous when a field name itself contains a dot,
//! so the feed may also list the explicit segments of such paths.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// One segment of a disambiguated path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Array index.
    Index(u64),
    /// Object key.
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{}", i),
            PathSegment::Key(k) => write!(f, "{}", k),
        }
    }
}

/// An array shortened by an update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncatedArray {
    pub field: String,
    pub new_size: u64,
}

/// A partial mutation as reported by the change feed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Map<String, Value>,

    #[serde(default)]
    pub removed_fields: Vec<String>,

    #[serde(default)]
    pub truncated_arrays: Vec<TruncatedArray>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub disambiguated_paths: BTreeMap<String, Vec<PathSegment>>,
}

impl UpdateDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `path` to `value`.
    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.updated_fields.insert(path.into(), value);
        self
    }

    /// Remove the field at `path`.
    pub fn remove(mut self, path: impl Into<String>) -> Self {
        self.removed_fields.push(path.into());
        self
    }

    /// Truncate the array at `path` to `new_size` elements.
    pub fn truncate(mut self, path: impl Into<String>, new_size: u64) -> Self {
        self.truncated_arrays.push(TruncatedArray {
            field: path.into(),
            new_size,
        });
        self
    }

    /// Record the explicit segments of an ambiguous path.
    pub fn disambiguate(mut self, path: impl Into<String>, segments: Vec<PathSegment>) -> Self {
        self.disambiguated_paths.insert(path.into(), segments);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.updated_fields.is_empty()
            && self.removed_fields.is_empty()
            && self.truncated_arrays.is_empty()
    }

    /// Resolve a dotted path to its segments, as rendered patch keys.
    pub fn resolve(&self, path: &str) -> Vec<String> {
        match self.disambiguated_paths.get(path) {
            Some(segments) => segments.iter().map(|s| s.to_string()).collect(),
            None => path.split('.').map(str::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_splits_on_dots() {
        let desc = UpdateDescription::new();
        assert_eq!(desc.resolve("a.b.c"), vec!["a", "b", "c"]);
        assert_eq!(desc.resolve("top"), vec!["top"]);
    }

    #[test]
    fn test_resolve_prefers_disambiguated_segments() {
        let desc = UpdateDescription::new().disambiguate(
            "a.b.0",
            vec![PathSegment::Key("a.b".into()), PathSegment::Index(0)],
        );
        assert_eq!(desc.resolve("a.b.0"), vec!["a.b", "0"]);
    }

    #[test]
    fn test_deserialize_native_shape() {
        let raw = json!({
            "updatedFields": {"x.y": 2},
            "removedFields": ["z"],
            "truncatedArrays": [{"field": "list", "newSize": 1}],
            "disambiguatedPaths": {"x.y": ["x", "y"]}
        });
        let desc: UpdateDescription = serde_json::from_value(raw).unwrap();
        assert_eq!(desc.updated_fields["x.y"], json!(2));
        assert_eq!(desc.removed_fields, vec!["z"]);
        assert_eq!(desc.truncated_arrays[0].new_size, 1);
        assert_eq!(
            desc.disambiguated_paths["x.y"],
            vec![PathSegment::Key("x".into()), PathSegment::Key("y".into())]
        );
    }

    #[test]
    fn test_missing_parts_default_to_empty() {
        let desc: UpdateDescription = serde_json::from_value(json!({})).unwrap();
        assert!(desc.is_empty());
    }
}
