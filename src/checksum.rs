//! Canonical encoding and SHA-256 sealing of bundles.
//!
//! The canonical form is compact JSON with object keys sorted
//! lexicographically at every depth. `metadata.checksum` is excluded from the
//! digest so the value can live inside the document it covers.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::bundle::Bundle;

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("failed to serialize bundle for hashing: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Digest of `bundle` ignoring whatever checksum it currently carries.
pub fn generate_checksum(bundle: &Bundle) -> Result<String, ChecksumError> {
    let value = serde_json::to_value(bundle)?;
    Ok(checksum_document(&value))
}

/// Recomputes and compares against `metadata.checksum`.
pub fn verify_checksum(bundle: &Bundle) -> Result<bool, ChecksumError> {
    Ok(generate_checksum(bundle)? == bundle.metadata.checksum)
}

/// Returns a copy of `bundle` sealed with its checksum.
pub fn add_checksum(bundle: &Bundle) -> Result<Bundle, ChecksumError> {
    let checksum = generate_checksum(bundle)?;
    let mut sealed = bundle.clone();
    sealed.metadata.checksum = checksum;
    Ok(sealed)
}

/// Digest of a raw bundle document with `metadata.checksum` removed.
pub fn checksum_document(document: &Value) -> String {
    let mut stripped = document.clone();
    if let Some(metadata) = stripped.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("checksum");
    }
    sha256_hex(canonical_json(&stripped).as_bytes())
}

/// True when `metadata.checksum` is a string equal to the recomputed digest.
pub fn verify_document(document: &Value) -> bool {
    let stored = document
        .get("metadata")
        .and_then(|m| m.get("checksum"))
        .and_then(Value::as_str);
    match stored {
        Some(stored) => stored == checksum_document(document),
        None => false,
    }
}

/// Digest of any serializable payload under the canonical encoding.
pub fn calculate_data_checksum<T: Serialize>(data: &T) -> Result<String, ChecksumError> {
    let value = serde_json::to_value(data)?;
    Ok(sha256_hex(canonical_json(&value).as_bytes()))
}

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
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
