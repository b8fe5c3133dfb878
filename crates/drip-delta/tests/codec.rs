//! Codec laws: applying an encoded description reproduces the post-image the
//! store would compute, and application never mutates its input.

use drip_delta::{apply, apply_update_description, encode, Patch, UpdateDescription};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1000i64..1000).prop_map(Value::from),
        "[a-z]{0,6}".prop_map(Value::String),
    ]
}

/// Flat-ish documents: a few top-level scalars, one nested object and one array.
fn document() -> impl Strategy<Value = Value> {
    (
        prop::collection::btree_map("[a-e]", leaf(), 0..5),
        prop::collection::btree_map("[a-e]", leaf(), 0..4),
        prop::collection::vec(leaf(), 0..6),
    )
        .prop_map(|(top, nested, list)| {
            let mut doc: Map<String, Value> = top.into_iter().collect();
            doc.insert("nested".into(), Value::Object(nested.into_iter().collect()));
            doc.insert("list".into(), Value::Array(list));
            Value::Object(doc)
        })
}

#[derive(Clone, Debug)]
enum Edit {
    SetTop(String, Value),
    SetNested(String, Value),
    RemoveTop(String),
    RemoveNested(String),
    Truncate(u64),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        ("[f-h]", leaf()).prop_map(|(k, v)| Edit::SetTop(k, v)),
        ("[a-e]", leaf()).prop_map(|(k, v)| Edit::SetNested(k, v)),
        "[a-e]".prop_map(Edit::RemoveTop),
        "[a-e]".prop_map(Edit::RemoveNested),
        (0u64..4).prop_map(Edit::Truncate),
    ]
}

/// Reference post-image computed by walking the edits directly.
fn expected_post_image(old: &Value, edits: &[Edit]) -> Value {
    let mut doc = old.clone();
    let root = doc.as_object_mut().unwrap();
    for e in edits {
        match e {
            Edit::SetTop(k, v) => {
                root.insert(k.clone(), v.clone());
            }
            Edit::SetNested(k, v) => {
                root["nested"].as_object_mut().unwrap().insert(k.clone(), v.clone());
            }
            Edit::RemoveTop(k) => {
                root.remove(k);
            }
            Edit::RemoveNested(k) => {
                root["nested"].as_object_mut().unwrap().remove(k);
            }
            Edit::Truncate(n) => {
                root["list"].as_array_mut().unwrap().truncate(*n as usize);
            }
        }
    }
    doc
}

/// Keep at most one edit per path, the way the store reports a single update.
fn dedup_by_path(edits: Vec<Edit>) -> Vec<Edit> {
    let mut seen = std::collections::BTreeSet::new();
    edits
        .into_iter()
        .filter(|e| {
            let path = match e {
                Edit::SetTop(k, _) | Edit::RemoveTop(k) => k.clone(),
                Edit::SetNested(k, _) | Edit::RemoveNested(k) => format!("nested.{}", k),
                Edit::Truncate(_) => "list".to_string(),
            };
            seen.insert(path)
        })
        .collect()
}

fn describe(edits: &[Edit]) -> UpdateDescription {
    edits.iter().fold(UpdateDescription::new(), |desc, e| match e {
        Edit::SetTop(k, v) => desc.set(k.clone(), v.clone()),
        Edit::SetNested(k, v) => desc.set(format!("nested.{}", k), v.clone()),
        Edit::RemoveTop(k) => desc.remove(k.clone()),
        Edit::RemoveNested(k) => desc.remove(format!("nested.{}", k)),
        Edit::Truncate(n) => desc.truncate("list", *n),
    })
}

proptest! {
    #[test]
    fn encoded_description_reproduces_post_image(
        old in document(),
        edits in prop::collection::vec(edit(), 0..8)
    ) {
        let edits = dedup_by_path(edits);
        let expected = expected_post_image(&old, &edits);
        let got = apply(&old, &encode(&describe(&edits))).unwrap();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn apply_never_mutates_input(
        old in document(),
        edits in prop::collection::vec(edit(), 0..8)
    ) {
        let snapshot = old.clone();
        let _ = apply(&old, &encode(&describe(&dedup_by_path(edits))));
        prop_assert_eq!(old, snapshot);
    }

    #[test]
    fn empty_patch_is_identity(old in document()) {
        prop_assert_eq!(apply(&old, &Patch::empty()).unwrap(), old);
    }
}

#[test]
fn test_patch_survives_json_round_trip() {
    let desc = UpdateDescription::new()
        .set("profile.name", json!("Bo"))
        .remove("profile.nick")
        .truncate("history", 0);
    let patch = encode(&desc);

    let bytes = serde_json::to_vec(&patch).unwrap();
    let decoded: Patch = serde_json::from_slice(&bytes).unwrap();

    let old = json!({"profile": {"name": "Al", "nick": "a"}, "history": [1, 2]});
    assert_eq!(
        apply(&old, &decoded).unwrap(),
        json!({"profile": {"name": "Bo"}, "history": []})
    );
}

#[test]
fn test_native_description_from_feed_json() {
    let raw = json!({
        "updatedFields": {"status": "shipped", "lines.1.qty": 3},
        "removedFields": ["draft"],
        "truncatedArrays": []
    });
    let desc: UpdateDescription = serde_json::from_value(raw).unwrap();
    let old = json!({
        "_id": 1,
        "status": "open",
        "draft": true,
        "lines": [{"qty": 1}, {"qty": 1}]
    });
    assert_eq!(
        apply_update_description(&old, &desc).unwrap(),
        json!({"_id": 1, "status": "shipped", "lines": [{"qty": 1}, {"qty": 3}]})
    );
}

#[test]
fn test_invalid_patch_reports_path() {
    let old = json!({"a": {"b": 1}});
    let bad = Patch::from_value(json!({"sa": {"q": {}}})).unwrap();
    let err = apply(&old, &bad).unwrap_err();
    assert!(err.to_string().contains("`a`"), "{}", err);
}
