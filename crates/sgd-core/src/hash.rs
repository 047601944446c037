//! Deterministic content hashing used for dedup keys, cache keys, and embed caching.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 over the canonical (serde_json, key-sorted via `BTreeMap` semantics
/// on the caller's side) serialization of `value`. Callers that need stable
/// hashes across field-reordering should serialize through a `BTreeMap` or a
/// struct with a fixed field order; `serde_json` itself preserves struct
/// field declaration order, which is stable across compilations.
pub fn content_hash<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).expect("value must serialize to JSON");
    hex_sha256(&bytes)
}

/// SHA-256 over typed, separator-delimited parts, never a naive concatenation
/// of raw strings (which would let `("ab", "c")` collide with `("a", "bc")`).
pub fn keyed_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// SHA-256 over raw bytes, hex-encoded.
pub fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Minimal hex encoder so the crate does not need an extra dependency purely
/// for hex digests (sha2's output is a fixed-size byte array).
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_value_same_hash() {
        let a = content_hash(&json!({"x": 1, "y": "z"}));
        let b = content_hash(&json!({"x": 1, "y": "z"}));
        assert_eq!(a, b);
    }

    #[test]
    fn different_value_different_hash() {
        let a = content_hash(&json!({"x": 1}));
        let b = content_hash(&json!({"x": 2}));
        assert_ne!(a, b);
    }

    #[test]
    fn keyed_hash_does_not_collide_on_concatenation_boundary() {
        let a = keyed_hash(&["ab", "c"]);
        let b = keyed_hash(&["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn hex_sha256_is_64_chars() {
        assert_eq!(hex_sha256(b"hello").len(), 64);
    }
}
