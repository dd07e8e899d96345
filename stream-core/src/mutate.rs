//! Mutation engine: forward and inverse diffs over state payloads
//!
//! The log stores mutations as the output of [`diff`] and replays them
//! with [`apply`]; the pair round-trips, `apply(old, diff(old, new)) ==
//! new`. Diffs are plain string-keyed maps: nested objects merge
//! recursively, any other value replaces the previous one wholesale, and
//! `null` removes a key. A literal `null` is therefore reserved by the
//! codec; states that need an explicit null must model it in-band.

use crate::types::StateData;
use serde_json::Value;

/// Compute the mutation that transforms `old` into `new`.
pub fn diff(old: &StateData, new: &StateData) -> StateData {
    let mut out = StateData::new();

    for (key, new_val) in new {
        match (old.get(key), new_val) {
            (Some(old_val), _) if old_val == new_val => {}
            (Some(Value::Object(old_obj)), Value::Object(new_obj)) => {
                out.insert(key.clone(), Value::Object(diff(old_obj, new_obj)));
            }
            _ => {
                out.insert(key.clone(), new_val.clone());
            }
        }
    }

    for key in old.keys() {
        if !new.contains_key(key) {
            out.insert(key.clone(), Value::Null);
        }
    }

    out
}

/// Apply a mutation to a state, returning the resulting state. The input
/// state is left untouched.
pub fn apply(state: &StateData, mutation: &StateData) -> StateData {
    let mut out = state.clone();

    for (key, patch) in mutation {
        match patch {
            Value::Null => {
                out.remove(key);
            }
            Value::Object(patch_obj) => {
                // Merge into the existing object, or build one from scratch
                // when the previous value was not an object.
                let base = match out.get(key) {
                    Some(Value::Object(existing)) => existing.clone(),
                    _ => StateData::new(),
                };
                out.insert(key.clone(), Value::Object(apply(&base, patch_obj)));
            }
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> StateData {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {}", other),
        }
    }

    #[test]
    fn test_diff_apply_round_trip() {
        let cases = [
            (json!({}), json!({"a": 1})),
            (json!({"a": 1}), json!({})),
            (json!({"a": 1, "b": "x"}), json!({"a": 2, "b": "x"})),
            (json!({"a": {"b": 1, "c": 2}}), json!({"a": {"b": 1, "c": 3}})),
            (json!({"a": "scalar"}), json!({"a": {"nested": true}})),
            (json!({"a": {"nested": true}}), json!({"a": "scalar"})),
            (
                json!({"a": {"b": {"c": 1}}, "d": [1, 2]}),
                json!({"a": {"b": {"c": 2}}, "d": [3]}),
            ),
        ];

        for (old, new) in cases {
            let old = obj(old);
            let new = obj(new);
            let mutation = diff(&old, &new);
            assert_eq!(apply(&old, &mutation), new, "mutation {:?}", mutation);
        }
    }

    #[test]
    fn test_inverse_diff_rewinds() {
        let before = obj(json!({"hello": "world", "count": 1}));
        let after = obj(json!({"hello": {"there": 2}, "extra": true}));

        let forward = diff(&before, &after);
        let inverse = diff(&after, &before);

        let advanced = apply(&before, &forward);
        assert_eq!(advanced, after);
        assert_eq!(apply(&advanced, &inverse), before);
    }

    #[test]
    fn test_null_removes_key() {
        let state = obj(json!({"hello": "world", "keep": 1}));
        let mutation = obj(json!({"hello": null}));
        assert_eq!(apply(&state, &mutation), obj(json!({"keep": 1})));
    }

    #[test]
    fn test_object_patch_replaces_scalar() {
        let state = obj(json!({"hello": "world"}));
        let mutation = obj(json!({"hello": {"there": 1}}));
        assert_eq!(apply(&state, &mutation), obj(json!({"hello": {"there": 1}})));
    }

    #[test]
    fn test_apply_leaves_input_untouched() {
        let state = obj(json!({"a": {"b": 1}}));
        let snapshot = state.clone();
        let _ = apply(&state, &obj(json!({"a": {"b": 2}})));
        assert_eq!(state, snapshot);
    }

    #[test]
    fn test_unchanged_keys_are_omitted() {
        let old = obj(json!({"a": 1, "b": {"c": 2}}));
        let new = obj(json!({"a": 1, "b": {"c": 2}, "d": 3}));
        let mutation = diff(&old, &new);
        assert_eq!(mutation, obj(json!({"d": 3})));
    }
}
