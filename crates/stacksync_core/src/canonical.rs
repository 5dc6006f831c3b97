use serde::Serialize;
use serde_json::Value;

/// Fields assigned by the remote system that must not influence equality.
const VOLATILE_FIELDS: [&str; 5] = ["uid", "created_at", "updated_at", "created_by", "updated_by"];

/// Reduce a JSON value to a canonical form for semantic comparison: volatile
/// server-assigned fields are dropped, and an absent/empty parent reference is
/// treated the same as none at all.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                if VOLATILE_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                if key == "parent" && is_empty_parent(item) {
                    continue;
                }
                out.insert(key.clone(), canonicalize(item));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn is_empty_parent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Order-independent semantic equivalence. Serialization failures err on the
/// side of "different" so the item gets re-sent rather than silently skipped.
pub fn equivalent<T: Serialize>(a: &T, b: &T) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(left), Ok(right)) => canonicalize(&left) == canonicalize(&right),
        _ => false,
    }
}
