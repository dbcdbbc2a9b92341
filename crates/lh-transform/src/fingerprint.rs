// Payload fingerprinting: a stable hash over a payload's type skeleton.
//
// Two payloads with the same key sets and per-key scalar types hash
// identically; any value change that preserves the shape leaves the digest
// untouched. This is what lets a single synthesised transform serve every
// future webhook of the same shape at zero LLM cost.

use sha2::{Digest, Sha256};

/// Replace every value in `payload` with its type name, recursively.
///
/// - objects → nested skeletons
/// - lists → a one-element list holding the first element's skeleton
///   (subsequent elements are ignored for shape purposes); empty lists stay
///   empty
/// - scalars → `"string" | "number" | "boolean" | "null"`
/// - a non-object top level → `{}`
pub fn type_skeleton(payload: &serde_json::Value) -> serde_json::Value {
    let Some(map) = payload.as_object() else {
        return serde_json::Value::Object(serde_json::Map::new());
    };
    let mut skeleton = serde_json::Map::new();
    for (key, value) in map {
        skeleton.insert(key.clone(), skeleton_value(value));
    }
    serde_json::Value::Object(skeleton)
}

fn skeleton_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(_) => type_skeleton(value),
        serde_json::Value::Array(items) => match items.first() {
            Some(first @ serde_json::Value::Object(_)) => {
                serde_json::Value::Array(vec![type_skeleton(first)])
            }
            Some(first) => serde_json::Value::Array(vec![scalar_name(first)]),
            None => serde_json::Value::Array(Vec::new()),
        },
        scalar => scalar_name(scalar),
    }
}

fn scalar_name(value: &serde_json::Value) -> serde_json::Value {
    let name = match value {
        serde_json::Value::String(_) => "string",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Null => "null",
        // Nested containers are handled before we get here.
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => "object",
    };
    serde_json::Value::String(name.to_owned())
}

/// Deterministic serialisation of a skeleton: lexicographically sorted keys,
/// no incidental whitespace. Sorting is explicit so the digest does not
/// depend on map iteration order.
pub fn canonical_string(skeleton: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(skeleton, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// 64-hex SHA-256 digest of the payload's canonicalised type skeleton.
pub fn fingerprint(payload: &serde_json::Value) -> String {
    let canonical = canonical_string(&type_skeleton(payload));
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_deterministic() {
        let payload = json!({"action": "opened", "pull_request": {"id": 1374}});
        assert_eq!(fingerprint(&payload), fingerprint(&payload));
        assert_eq!(fingerprint(&payload).len(), 64);
    }

    #[test]
    fn value_changes_that_preserve_shape_keep_the_digest() {
        let first = json!({"action": "opened", "pull_request": {"id": 1374, "created_at": "2025-06-03T15:45:02Z"}, "repository": {"id": 987}});
        let second = json!({"action": "closed", "pull_request": {"id": 1375, "created_at": "2026-01-01T00:00:00Z"}, "repository": {"id": 123}});
        assert_eq!(fingerprint(&first), fingerprint(&second));
    }

    #[test]
    fn key_addition_changes_the_digest() {
        let base = json!({"a": 1});
        let wider = json!({"a": 1, "b": 1});
        assert_ne!(fingerprint(&base), fingerprint(&wider));
    }

    #[test]
    fn scalar_type_change_changes_the_digest() {
        assert_ne!(
            fingerprint(&json!({"id": 1374})),
            fingerprint(&json!({"id": "1374"}))
        );
    }

    #[test]
    fn key_order_does_not_matter() {
        let skeleton_a = canonical_string(&type_skeleton(&json!({"b": 1, "a": "x"})));
        let skeleton_b = canonical_string(&type_skeleton(&json!({"a": "y", "b": 2})));
        assert_eq!(skeleton_a, skeleton_b);
        assert_eq!(skeleton_a, r#"{"a":"string","b":"number"}"#);
    }

    #[test]
    fn skeleton_edge_cases() {
        let skeleton = type_skeleton(&json!({
            "empty_list": [],
            "nums": [1, 2, 3],
            "objs": [{"x": 1}, {"y": "different shape ignored"}],
            "none": null,
            "flag": true,
        }));
        assert_eq!(
            skeleton,
            json!({
                "empty_list": [],
                "nums": ["number"],
                "objs": [{"x": "number"}],
                "none": "null",
                "flag": "boolean",
            })
        );
    }

    #[test]
    fn non_object_top_level_hashes_as_empty_object() {
        assert_eq!(fingerprint(&json!([1, 2])), fingerprint(&json!({})));
        assert_eq!(canonical_string(&type_skeleton(&json!(42))), "{}");
    }
}
