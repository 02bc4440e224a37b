//! Canonical serialization and digest helpers.
//!
//! Block hashes must be reproducible regardless of how a structure was built,
//! so everything that gets hashed is first rendered as JSON with object keys
//! in lexicographic order.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value with recursively sorted object keys.
///
/// Separators follow the `", "` / `": "` convention so the output is stable
/// across serde_json feature flags (`preserve_order` in particular).
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push_str(": ");
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "y": [3, {"d": null, "c": "x"}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a": {"y": [3, {"c": "x", "d": null}], "z": true}, "b": 1}"#
        );
    }

    #[test]
    fn test_canonical_json_ignores_insertion_order() {
        let mut first = serde_json::Map::new();
        first.insert("receiver".into(), json!("B"));
        first.insert("sender".into(), json!("A"));
        let mut second = serde_json::Map::new();
        second.insert("sender".into(), json!("A"));
        second.insert("receiver".into(), json!("B"));
        assert_eq!(
            canonical_json(&Value::Object(first)),
            canonical_json(&Value::Object(second))
        );
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
