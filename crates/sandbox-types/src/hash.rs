//! Canonical JSON and the content hashes derived from it.
//!
//! Hashing drives both audit-trail integrity verification and the
//! plan-equivalence check replay performs, so the canonicalization here
//! must be stable across processes: sorted keys, no ambient whitespace,
//! ISO-8601 timestamps, `None`/absent mapped to the empty string.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Re-serialize a JSON value with object keys sorted and no ambient
/// whitespace. Non-finite numbers are rejected by `serde_json` itself
/// (it cannot represent NaN/Infinity), so no separate check is needed.
pub fn canonical_json(value: &Value) -> String {
    let canon = canonicalize(value);
    serde_json::to_string(&canon).expect("canonicalized value always serializes")
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hash any serializable value as the hex SHA-256 digest of its
/// canonical JSON form. `None` (and the JSON `null` it serializes to)
/// maps to the empty string rather than the literal bytes `"null"`, so
/// an absent output and a present-but-empty output hash differently
/// only when the caller actually distinguishes them upstream.
pub fn hash<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_value(value).unwrap_or(Value::Null);
    hash_value(&json)
}

/// Hash a `serde_json::Value` directly, with the `None`-maps-to-empty-
/// string rule spec.md §4.1 specifies.
pub fn hash_value(value: &Value) -> String {
    if value.is_null() {
        return hash_bytes(b"");
    }
    hash_bytes(canonical_json(value).as_bytes())
}

/// Hash an already-serialized string (used by callers that already
/// hold the canonical JSON, e.g. stored rows being re-verified).
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A short, human-referenceable, collision-resistant identifier.
///
/// Backed by a UUIDv4: the collision probability across the lifetime of
/// a single audit store is negligible, and `uuid` is already a
/// dependency of every crate that needs one.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_deterministic() {
        let v = json!({"b": 1, "a": [1, 2, 3], "c": {"z": true, "y": "x"}});
        assert_eq!(hash(&v), hash(&v));
    }

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn none_hashes_as_empty_string() {
        let none: Option<Value> = None;
        assert_eq!(hash(&none), hash_str(""));
    }

    #[test]
    fn different_values_hash_differently() {
        assert_ne!(hash(&json!({"a": 1})), hash(&json!({"a": 2})));
    }

    #[test]
    fn new_id_is_unique_enough() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn canonical_json_has_no_ambient_whitespace() {
        let v = json!({"a": 1, "b": 2});
        let s = canonical_json(&v);
        assert!(!s.contains(' '));
        assert_eq!(s, r#"{"a":1,"b":2}"#);
    }
}
