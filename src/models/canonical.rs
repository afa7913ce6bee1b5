//! Canonical JSON rendering shared by content-addressed metadata and
//! service state values.
//!
//! The canonical form must match bit-for-bit across implementations:
//! nulls, empty mappings and empty sequences are stripped recursively,
//! mapping keys are string-only and sorted, separators are compact,
//! non-ASCII characters are emitted as UTF-8 (never escaped), and
//! non-finite floats are dropped. Subtrees deeper than
//! [`MAX_SANITIZE_DEPTH`] collapse to null and are stripped.
//!
//! `serde_json`'s default object representation is a `BTreeMap`, so any
//! object assembled here serializes with byte-lexicographic (equals
//! code-point) key order; `serde_json::to_string` provides the compact,
//! non-escaping rendering.

use serde_json::{Map, Value};
use thiserror::Error;

/// Subtrees nested deeper than this become null and get stripped.
pub const MAX_SANITIZE_DEPTH: usize = 50;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanonicalJsonError {
    #[error("{field} contains null bytes")]
    NullBytes { field: String },

    #[error("{field} key contains null bytes")]
    NullBytesInKey { field: String },
}

/// Recursively normalize a JSON value for deterministic serialization.
///
/// Returns `None` when the sanitized value is empty (null, `{}`, `[]`)
/// and would itself be stripped by an enclosing container.
///
/// # Errors
///
/// Returns [`CanonicalJsonError`] if any string value or mapping key
/// contains a null byte. PostgreSQL TEXT and JSONB columns reject them.
pub fn sanitize(value: &Value, field: &str) -> Result<Option<Value>, CanonicalJsonError> {
    sanitize_at_depth(value, field, 0)
}

fn sanitize_at_depth(
    value: &Value,
    field: &str,
    depth: usize,
) -> Result<Option<Value>, CanonicalJsonError> {
    if depth > MAX_SANITIZE_DEPTH {
        return Ok(None);
    }

    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(Value::Bool(*b))),
        Value::Number(n) => {
            // serde_json numbers are finite by construction; anything
            // that cannot round-trip through f64/i64/u64 is dropped.
            if n.is_i64() || n.is_u64() || n.as_f64().is_some_and(f64::is_finite) {
                Ok(Some(Value::Number(n.clone())))
            } else {
                Ok(None)
            }
        }
        Value::String(s) => {
            if s.contains('\0') {
                return Err(CanonicalJsonError::NullBytes {
                    field: field.to_string(),
                });
            }
            Ok(Some(Value::String(s.clone())))
        }
        Value::Array(items) => {
            let mut result = Vec::with_capacity(items.len());
            for item in items {
                if let Some(v) = sanitize_at_depth(item, field, depth + 1)? {
                    result.push(v);
                }
            }
            if result.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Value::Array(result)))
            }
        }
        Value::Object(entries) => {
            // Map is a BTreeMap: insertion here yields sorted key order.
            let mut result = Map::new();
            for (key, item) in entries {
                if key.contains('\0') {
                    return Err(CanonicalJsonError::NullBytesInKey {
                        field: field.to_string(),
                    });
                }
                if let Some(v) = sanitize_at_depth(item, field, depth + 1)? {
                    result.insert(key.clone(), v);
                }
            }
            if result.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Value::Object(result)))
            }
        }
    }
}

/// Sanitize a value and render its canonical JSON string.
///
/// A value that sanitizes to nothing renders as `{}` for mappings (the
/// usual case for metadata payloads) so the output is always valid JSON.
pub fn canonical_json(value: &Value, field: &str) -> Result<(Value, String), CanonicalJsonError> {
    let sanitized = sanitize(value, field)?.unwrap_or(Value::Object(Map::new()));
    let rendered =
        serde_json::to_string(&sanitized).expect("sanitized JSON value always serializes");
    Ok((sanitized, rendered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strips_nulls_and_empty_containers() {
        let value = json!({"a": 1, "b": null, "c": {}, "d": [], "e": {"f": null}});
        let (_, rendered) = canonical_json(&value, "data").unwrap();
        assert_eq!(rendered, r#"{"a":1}"#);
    }

    #[test]
    fn test_keys_sorted_and_compact() {
        let value = json!({"zebra": 1, "alpha": {"y": 2, "x": 3}});
        let (_, rendered) = canonical_json(&value, "data").unwrap();
        assert_eq!(rendered, r#"{"alpha":{"x":3,"y":2},"zebra":1}"#);
    }

    #[test]
    fn test_key_order_independence() {
        let a = json!({"b": 2, "a": 1, "c": [1, 2, 3]});
        let b = json!({"c": [1, 2, 3], "a": 1, "b": 2});
        assert_eq!(
            canonical_json(&a, "data").unwrap().1,
            canonical_json(&b, "data").unwrap().1
        );
    }

    #[test]
    fn test_sequences_preserve_order() {
        let value = json!({"list": [3, 1, 2]});
        let (_, rendered) = canonical_json(&value, "data").unwrap();
        assert_eq!(rendered, r#"{"list":[3,1,2]}"#);
    }

    #[test]
    fn test_non_ascii_not_escaped() {
        let value = json!({"name": "リレー"});
        let (_, rendered) = canonical_json(&value, "data").unwrap();
        assert_eq!(rendered, "{\"name\":\"リレー\"}");
    }

    #[test]
    fn test_null_bytes_rejected() {
        let value = json!({"name": "bad\0value"});
        let err = canonical_json(&value, "data").unwrap_err();
        assert!(matches!(err, CanonicalJsonError::NullBytes { .. }));
    }

    #[test]
    fn test_null_bytes_in_key_rejected() {
        let mut map = Map::new();
        map.insert("bad\0key".to_string(), json!(1));
        let err = canonical_json(&Value::Object(map), "data").unwrap_err();
        assert!(matches!(err, CanonicalJsonError::NullBytesInKey { .. }));
    }

    #[test]
    fn test_depth_limit_strips_deep_subtrees() {
        let mut value = json!("leaf");
        for _ in 0..(MAX_SANITIZE_DEPTH + 5) {
            value = json!({ "nested": value });
        }
        let (_, rendered) = canonical_json(&value, "data").unwrap();
        // The over-deep tail collapses to null and the now-empty
        // ancestors are stripped all the way up.
        assert_eq!(rendered, "{}");

        let mut shallow = json!("leaf");
        for _ in 0..10 {
            shallow = json!({ "nested": shallow });
        }
        let (_, rendered) = canonical_json(&shallow, "data").unwrap();
        assert!(rendered.contains("leaf"));
    }

    #[test]
    fn test_empty_input_renders_empty_object() {
        let (_, rendered) = canonical_json(&json!({}), "data").unwrap();
        assert_eq!(rendered, "{}");
        let (_, rendered) = canonical_json(&Value::Null, "data").unwrap();
        assert_eq!(rendered, "{}");
    }
}
