//! Compact, self-describing patches.
//!
//! A patch is a JSON object. At each level:
//!
//! ```text
//! d        { name: false, ... }      delete fields
//! t        { name: newLength, ... }  truncate arrays
//! i        { name: value, ... }      insert or overwrite fields
//! s<name>  { ...patch... }           patch the nested container at `name`
//! ```
//!
//! Operations whose paths share a prefix live under the same `s<name>` chain.

use crate::description::UpdateDescription;
use crate::error::{DeltaError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const DELETE: &str = "d";
pub const TRUNCATE: &str = "t";
pub const INSERT: &str = "i";
pub const SUB_PATCH_PREFIX: char = 's';

/// An encoded update description.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Map<String, Value>);

impl Patch {
    /// The empty patch; applying it is the identity.
    pub fn empty() -> Self {
        Self(Map::new())
    }

    /// Wrap a decoded JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DeltaError::invalid(
                "",
                format!("patch must be an object, found {}", type_name(&other)),
            )),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Intermediate tree used while grouping operations by path.
#[derive(Default)]
struct PatchNode {
    delete: Map<String, Value>,
    truncate: Map<String, Value>,
    insert: Map<String, Value>,
    children: BTreeMap<String, PatchNode>,
}

impl PatchNode {
    /// Walk (creating as needed) to the node owning the leaf of `segments`.
    fn leaf_parent(&mut self, segments: &[String]) -> &mut PatchNode {
        let mut node = self;
        for segment in segments {
            node = node.children.entry(segment.clone()).or_default();
        }
        node
    }

    fn into_map(self) -> Map<String, Value> {
        let mut map = Map::new();
        if !self.delete.is_empty() {
            map.insert(DELETE.to_string(), Value::Object(self.delete));
        }
        if !self.truncate.is_empty() {
            map.insert(TRUNCATE.to_string(), Value::Object(self.truncate));
        }
        if !self.insert.is_empty() {
            map.insert(INSERT.to_string(), Value::Object(self.insert));
        }
        for (name, child) in self.children {
            map.insert(format!("{}{}", SUB_PATCH_PREFIX, name), Value::Object(child.into_map()));
        }
        map
    }
}

/// Encode a store-native update description as a patch.
pub fn encode(description: &UpdateDescription) -> Patch {
    let mut root = PatchNode::default();

    for path in &description.removed_fields {
        if let Some((leaf, parents)) = description.resolve(path).split_last() {
            root.leaf_parent(parents).delete.insert(leaf.clone(), Value::Bool(false));
        }
    }

    for truncated in &description.truncated_arrays {
        if let Some((leaf, parents)) = description.resolve(&truncated.field).split_last() {
            root.leaf_parent(parents)
                .truncate
                .insert(leaf.clone(), Value::from(truncated.new_size));
        }
    }

    for (path, value) in &description.updated_fields {
        if let Some((leaf, parents)) = description.resolve(path).split_last() {
            root.leaf_parent(parents).insert.insert(leaf.clone(), value.clone());
        }
    }

    Patch(root.into_map())
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
