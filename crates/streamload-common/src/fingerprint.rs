//! Content fingerprints for canonical payloads
//!
//! A fingerprint is the hex-encoded SHA-256 of a value's canonical JSON
//! rendering. Object keys are sorted before hashing, so two payloads that
//! differ only in field order share a fingerprint.

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fingerprint raw bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fingerprint any serializable value through its canonical JSON form.
pub fn fingerprint_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut buf = String::new();
    write_canonical(&value, &mut buf)?;
    Ok(fingerprint_bytes(buf.as_bytes()))
}

/// Running fingerprint over an ordered sequence of strings.
///
/// Each item is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` differ.
#[derive(Clone, Default)]
pub struct SequenceFingerprint {
    hasher: Sha256,
    len: u64,
}

impl SequenceFingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: &str) {
        self.hasher.update((item.len() as u64).to_le_bytes());
        self.hasher.update(item.as_bytes());
        self.len += 1;
    }

    /// Number of items pushed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hex digest of everything pushed so far; pushing may continue.
    pub fn hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out)?;
                }
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        },
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
