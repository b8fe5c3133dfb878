//! Patch application.
//!
//! `apply` is pure: it returns a new value and never touches its input.
//! A patch level may target an object (fields addressed by name) or an
//! array (elements addressed by decimal index).

use crate::description::UpdateDescription;
use crate::error::{DeltaError, Result};
use crate::patch::{encode, type_name, Patch, DELETE, INSERT, SUB_PATCH_PREFIX, TRUNCATE};
use serde_json::{Map, Value};

/// Apply `patch` to `old`, returning the patched value.
pub fn apply(old: &Value, patch: &Patch) -> Result<Value> {
    if patch.is_empty() {
        return Ok(old.clone());
    }
    let mut new_value = old.clone();
    apply_level(&mut new_value, patch.as_map(), "")?;
    Ok(new_value)
}

/// Apply a store-native update description directly.
pub fn apply_update_description(old: &Value, description: &UpdateDescription) -> Result<Value> {
    apply(old, &encode(description))
}

fn apply_level(target: &mut Value, patch: &Map<String, Value>, path: &str) -> Result<()> {
    if !(target.is_object() || target.is_array()) {
        return Err(DeltaError::invalid(
            path,
            format!("cannot patch a {}", type_name(target)),
        ));
    }

    for (verb, body) in patch {
        match verb.as_str() {
            DELETE => delete_fields(target, verb_body(body, path, verb)?, path)?,
            TRUNCATE => truncate_arrays(target, verb_body(body, path, verb)?, path)?,
            INSERT => insert_fields(target, verb_body(body, path, verb)?, path)?,
            other if other.starts_with(SUB_PATCH_PREFIX) => {
                let field = &other[SUB_PATCH_PREFIX.len_utf8()..];
                let child_path = join(path, field);
                let sub_patch = verb_body(body, path, verb)?;
                let child = child_mut(target, field).ok_or_else(|| {
                    DeltaError::invalid(&child_path, "sub-patch target does not exist")
                })?;
                apply_level(child, sub_patch, &child_path)?;
            }
            other => {
                return Err(DeltaError::invalid(path, format!("unknown patch key `{}`", other)));
            }
        }
    }
    Ok(())
}

fn verb_body<'a>(body: &'a Value, path: &str, verb: &str) -> Result<&'a Map<String, Value>> {
    body.as_object().ok_or_else(|| {
        DeltaError::invalid(
            path,
            format!("`{}` must map to an object, found {}", verb, type_name(body)),
        )
    })
}

fn delete_fields(target: &mut Value, fields: &Map<String, Value>, path: &str) -> Result<()> {
    match target {
        Value::Object(map) => {
            for name in fields.keys() {
                map.remove(name);
            }
            Ok(())
        }
        _ => Err(DeltaError::invalid(path, "cannot delete fields of an array")),
    }
}

fn truncate_arrays(target: &mut Value, fields: &Map<String, Value>, path: &str) -> Result<()> {
    for (name, length) in fields {
        let field_path = join(path, name);
        let new_len = length.as_u64().ok_or_else(|| {
            DeltaError::invalid(
                &field_path,
                format!("truncation length must be a non-negative integer, found {}", length),
            )
        })?;
        let new_len = usize::try_from(new_len)
            .map_err(|_| DeltaError::invalid(&field_path, "truncation length out of range"))?;

        match child_mut(target, name) {
            Some(Value::Array(items)) => items.truncate(new_len),
            Some(other) => {
                return Err(DeltaError::invalid(
                    &field_path,
                    format!("cannot truncate a {}", type_name(other)),
                ))
            }
            None => return Err(DeltaError::invalid(&field_path, "cannot truncate a missing field")),
        }
    }
    Ok(())
}

fn insert_fields(target: &mut Value, fields: &Map<String, Value>, path: &str) -> Result<()> {
    match target {
        Value::Object(map) => {
            for (name, value) in fields {
                map.insert(name.clone(), value.clone());
            }
            Ok(())
        }
        Value::Array(items) => {
            for (name, value) in fields {
                let idx = parse_index(name).ok_or_else(|| {
                    DeltaError::invalid(
                        &join(path, name),
                        "array elements must be addressed by index",
                    )
                })?;
                if idx >= items.len() {
                    items.resize(idx + 1, Value::Null);
                }
                items[idx] = value.clone();
            }
            Ok(())
        }
        other => Err(DeltaError::invalid(
            path,
            format!("cannot insert into a {}", type_name(other)),
        )),
    }
}

fn child_mut<'a>(target: &'a mut Value, field: &str) -> Option<&'a mut Value> {
    match target {
        Value::Object(map) => map.get_mut(field),
        Value::Array(items) => parse_index(field).and_then(move |idx| items.get_mut(idx)),
        _ => None,
    }
}

fn parse_index(field: &str) -> Option<usize> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

fn join(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}
