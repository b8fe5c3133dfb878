//! Client subset definitions.
//!
//! A [`Rule`] is an ordered list of pipeline stages. Replication never looks
//! inside it; only the store evaluates it. The in-memory store understands
//! `$match` stages with equality, comparison, `$in`/`$nin`, `$exists` and
//! `$and`/`$or` combinators.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rule(Vec<Value>);

impl Rule {
    pub fn new(stages: Vec<Value>) -> Self {
        Self(stages)
    }

    /// The empty pipeline; matches every document.
    pub fn all() -> Self {
        Self(Vec::new())
    }

    /// A single `$match` stage.
    pub fn matching(filter: Value) -> Self {
        Self(vec![json!({ "$match": filter })])
    }

    pub fn stages(&self) -> &[Value] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluate the pipeline against one document.
    pub fn matches(&self, doc: &Map<String, Value>) -> Result<bool> {
        for stage in &self.0 {
            let (name, filter) = stage
                .as_object()
                .filter(|s| s.len() == 1)
                .and_then(|s| s.iter().next())
                .ok_or_else(|| {
                    StoreError::InvalidRule(format!(
                        "stage must be a single-key object: {}",
                        stage
                    ))
                })?;
            if name != "$match" {
                return Err(StoreError::InvalidRule(format!("unsupported stage `{}`", name)));
            }
            let filter = filter
                .as_object()
                .ok_or_else(|| StoreError::InvalidRule("`$match` takes an object".into()))?;
            if !matches_filter(doc, filter)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn matches_filter(doc: &Map<String, Value>, filter: &Map<String, Value>) -> Result<bool> {
    for (field, condition) in filter {
        let ok = match field.as_str() {
            "$and" => each_clause(condition)?.iter().try_fold(true, |acc, clause| {
                Ok::<_, StoreError>(acc && matches_filter(doc, clause)?)
            })?,
            "$or" => each_clause(condition)?.iter().try_fold(false, |acc, clause| {
                Ok::<_, StoreError>(acc || matches_filter(doc, clause)?)
            })?,
            op if op.starts_with('$') => {
                return Err(StoreError::InvalidRule(format!(
                    "unsupported top-level operator `{}`",
                    op
                )));
            }
            path => matches_condition(lookup(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn each_clause(condition: &Value) -> Result<Vec<&Map<String, Value>>> {
    condition
        .as_array()
        .ok_or_else(|| StoreError::InvalidRule("`$and`/`$or` take an array".into()))?
        .iter()
        .map(|c| {
            c.as_object().ok_or_else(|| {
                StoreError::InvalidRule("`$and`/`$or` clauses must be objects".into())
            })
        })
        .collect()
}

fn matches_condition(actual: Option<&Value>, condition: &Value) -> Result<bool> {
    let operators = match condition {
        Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => ops,
        _ => return Ok(equals(actual, condition)),
    };

    for (op, operand) in operators {
        let ok = match op.as_str() {
            "$eq" => equals(actual, operand),
            "$ne" => !equals(actual, operand),
            "$gt" => compare(actual, operand) == Some(Ordering::Greater),
            "$gte" => matches!(compare(actual, operand), Some(Ordering::Greater | Ordering::Equal)),
            "$lt" => compare(actual, operand) == Some(Ordering::Less),
            "$lte" => matches!(compare(actual, operand), Some(Ordering::Less | Ordering::Equal)),
            "$in" => in_list(actual, operand)?,
            "$nin" => !in_list(actual, operand)?,
            "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
            other => {
                return Err(StoreError::InvalidRule(format!(
                    "unsupported operator `{}`",
                    other
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn lookup<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// A missing field equals `null`.
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        Some(value) => value == expected || numbers_equal(value, expected),
        None => expected.is_null(),
    }
}

fn numbers_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn compare(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (actual?, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn in_list(actual: Option<&Value>, operand: &Value) -> Result<bool> {
    let candidates = operand
        .as_array()
        .ok_or_else(|| StoreError::InvalidRule("`$in`/`$nin` take an array".into()))?;
    Ok(candidates.iter().any(|c| equals(actual, c)))
}
