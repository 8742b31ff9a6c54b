//! Canonical JSON serialization and definition hashing.
//!
//! The canonical form is deterministic across platforms: object keys sorted
//! lexicographically, no insignificant whitespace, negative/float zeros
//! normalized to integer zero. Hash-sensitive blobs are canonicalized on
//! write so the same definition always produces the same bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value to its canonical byte form.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// `sha256:<hex>` over the canonical bytes.
pub fn workflow_hash(definition: &Value) -> String {
    let canonical = canonical_string(definition);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// Parse, canonicalize, and re-serialize a JSON text.
pub fn canonicalize_text(text: &str) -> Result<String, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    Ok(canonical_string(&value))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            // Normalize 0.0 / -0.0 to plain 0 so equal definitions hash
            // identically regardless of how a producer wrote its zeros.
            if n.as_f64() == Some(0.0) {
                out.push('0');
            } else {
                out.push_str(&n.to_string());
            }
        }
        Value::String(s) => {
            // serde_json's escaping is already deterministic for strings.
            out.push_str(&Value::String(s.clone()).to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_whitespace_dropped() {
        let value: Value =
            serde_json::from_str("{ \"b\" : 1 , \"a\" : [ 2 , 3 ] }").unwrap();
        assert_eq!(canonical_string(&value), r#"{"a":[2,3],"b":1}"#);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let value = json!({
            "steps": [{"type": "tool", "tool": "npm_lint", "id": "lint"}],
            "name": "ship"
        });
        let once = canonical_string(&value);
        let twice = canonicalize_text(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn zeros_are_normalized() {
        let a: Value = serde_json::from_str(r#"{"x": 0.0}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"x": -0.0}"#).unwrap();
        let c: Value = serde_json::from_str(r#"{"x": 0}"#).unwrap();
        assert_eq!(canonical_string(&a), canonical_string(&c));
        assert_eq!(canonical_string(&b), canonical_string(&c));
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let a: Value = serde_json::from_str(r#"{"name":"w","steps":[{"type":"approval"}]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"steps":[{"type":"approval"}],"name":"w"}"#).unwrap();
        assert_eq!(workflow_hash(&a), workflow_hash(&b));
        assert!(workflow_hash(&a).starts_with("sha256:"));
        assert_eq!(workflow_hash(&a).len(), "sha256:".len() + 64);
    }

    #[test]
    fn validate_twice_yields_identical_hash() {
        let value = json!({"steps": [{"id": "a", "type": "tool", "tool": "t"}]});
        assert_eq!(workflow_hash(&value), workflow_hash(&value));
    }

    #[test]
    fn nested_structures_canonicalize() {
        let value = json!({
            "z": {"b": null, "a": true},
            "a": "text with \"quotes\""
        });
        assert_eq!(
            canonical_string(&value),
            r#"{"a":"text with \"quotes\"","z":{"a":true,"b":null}}"#
        );
    }
}
