//! Content fingerprints for normalised records
//!
//! A fingerprint is the hex SHA-256 digest of a JSON document written in a
//! canonical form: object keys sorted, no insignificant whitespace. Two
//! documents that differ only in key order share a fingerprint, so the loader
//! can decide "unchanged" without comparing payloads field by field.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the canonical form of `value`.
pub fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    write_canonical(value, &mut hasher);
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            hasher.update(b"{");
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                write_scalar(&Value::String(key.clone()), hasher);
                hasher.update(b":");
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, hasher);
                }
            }
            hasher.update(b"}");
        },
        Value::Array(items) => {
            hasher.update(b"[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                write_canonical(item, hasher);
            }
            hasher.update(b"]");
        },
        scalar => write_scalar(scalar, hasher),
    }
}

fn write_scalar(value: &Value, hasher: &mut Sha256) {
    // Display for scalars is compact JSON with escaped strings
    hasher.update(value.to_string().as_bytes());
}
