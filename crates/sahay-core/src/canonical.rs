//! Canonical hashing of records.
//!
//! All hashes in the system (audit entries, anchor payloads, closure hashes)
//! are SHA-256 over the RFC 8785 canonical JSON form of the payload:
//! key-sorted objects, no insignificant whitespace, numbers in their
//! shortest decimal form. Canonical form is part of the contract — a payload
//! must never be re-serialized with a different key order before hashing or
//! anchoring.
//!
//! Hashable payloads additionally reject fractional numbers outright:
//! floating-point ambiguity has no place in a value whose bytes feed a hash
//! chain or an on-chain anchor.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Length of every digest in the system.
pub const DIGEST_LEN: usize = 32;

/// Genesis sentinel: the `prev_hash` of the first audit entry.
pub const ZERO_DIGEST: [u8; DIGEST_LEN] = [0u8; DIGEST_LEN];

/// A 32-byte SHA-256 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest32(pub [u8; DIGEST_LEN]);

impl Digest32 {
    /// Hex-encodes the digest (64 lowercase characters).
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decodes a digest from its 64-character hex form.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the input is not exactly 32 hex-encoded bytes.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s).map_err(|e| Error::Validation(format!("bad digest: {e}")))?;
        let arr: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| Error::Validation("digest must be 32 bytes".to_string()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for Digest32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Serializes a value to its RFC 8785 canonical JSON string.
///
/// # Errors
///
/// Returns `Validation` if the value cannot be serialized canonically.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, Error> {
    serde_jcs::to_string(value).map_err(|e| Error::Validation(format!("canonicalization: {e}")))
}

/// Hashes a value: SHA-256 over the UTF-8 bytes of its canonical JSON form.
///
/// # Errors
///
/// Returns `Validation` if canonicalization fails.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<Digest32, Error> {
    let json = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(Digest32(hasher.finalize().into()))
}

/// Hashes a value and returns the hex form of the digest.
///
/// # Errors
///
/// Returns `Validation` if canonicalization fails.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> Result<String, Error> {
    Ok(canonical_hash(value)?.to_hex())
}

/// SHA-256 over raw bytes (blob digests, password derivation inputs).
#[must_use]
pub fn sha256(bytes: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Digest32(hasher.finalize().into())
}

/// Rejects payloads containing fractional numbers anywhere in the tree.
///
/// # Errors
///
/// Returns `InvalidPayload` naming the offending value.
pub fn ensure_hashable(value: &serde_json::Value) -> Result<(), Error> {
    match value {
        serde_json::Value::Number(n) => {
            if n.is_f64() {
                return Err(Error::InvalidPayload(format!(
                    "fractional number {n} is not allowed in hashable payloads"
                )));
            }
            Ok(())
        },
        serde_json::Value::Array(items) => items.iter().try_for_each(ensure_hashable),
        serde_json::Value::Object(map) => map.values().try_for_each(ensure_hashable),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn hash_is_stable_under_key_reordering() {
        let a = json!({"b": 2, "a": 1, "nested": {"y": "v", "x": [3, 1]}});
        let b = json!({"nested": {"x": [3, 1], "y": "v"}, "a": 1, "b": 2});
        assert_eq!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn hash_differs_on_value_change() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let v = json!({"z": 1, "a": 2});
        assert_eq!(canonical_json(&v).unwrap(), r#"{"a":2,"z":1}"#);
    }

    #[test]
    fn fractional_numbers_rejected() {
        let bad = json!({"temp": 38.5});
        assert!(matches!(
            ensure_hashable(&bad),
            Err(Error::InvalidPayload(_))
        ));
        let ok = json!({"count": 5, "tags": ["a"], "flag": true, "none": null});
        assert!(ensure_hashable(&ok).is_ok());
    }

    #[test]
    fn digest_hex_round_trip() {
        let d = sha256(b"sahay");
        let parsed = Digest32::from_hex(&d.to_hex()).unwrap();
        assert_eq!(d, parsed);
        assert_eq!(d.to_hex().len(), 64);
    }
}
