//! Content-addressed metadata with SHA-256 deduplication.
//!
//! Stores arbitrary JSON-compatible data under a type discriminator.
//! The identity of a record is the SHA-256 of its canonical JSON
//! rendering, so identical observations deduplicate in PostgreSQL
//! regardless of key order or stripped nulls at the source.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{BigBrotrError, Result};
use crate::models::canonical::canonical_json;

/// Metadata type identifiers stored in the `metadata.metadata_type`
/// column. Each value corresponds to one data source or health check
/// performed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataType {
    Nip11Info,
    Nip66Rtt,
    Nip66Ssl,
    Nip66Geo,
    Nip66Net,
    Nip66Dns,
    Nip66Http,
}

impl MetadataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataType::Nip11Info => "nip11_info",
            MetadataType::Nip66Rtt => "nip66_rtt",
            MetadataType::Nip66Ssl => "nip66_ssl",
            MetadataType::Nip66Geo => "nip66_geo",
            MetadataType::Nip66Net => "nip66_net",
            MetadataType::Nip66Dns => "nip66_dns",
            MetadataType::Nip66Http => "nip66_http",
        }
    }
}

impl fmt::Display for MetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable metadata with deterministic content hashing.
///
/// The data is sanitized on construction (nulls and empty containers
/// removed, keys sorted) and rendered once into the canonical JSON
/// string that is both hashed and handed to the JSONB codec verbatim.
///
/// The hash is derived from `data` only; `metadata_type` is not part of
/// the hash but belongs to the composite primary key `(id, type)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    metadata_type: MetadataType,
    data: Value,
    canonical_json: String,
    content_hash: [u8; 32],
}

impl Metadata {
    pub fn new(metadata_type: MetadataType, data: Value) -> Result<Self> {
        let (sanitized, rendered) = canonical_json(&data, "data")
            .map_err(|e| BigBrotrError::ModelValidation(e.to_string()))?;
        let content_hash: [u8; 32] = Sha256::digest(rendered.as_bytes()).into();
        Ok(Self {
            metadata_type,
            data: sanitized,
            canonical_json: rendered,
            content_hash,
        })
    }

    pub fn metadata_type(&self) -> MetadataType {
        self.metadata_type
    }

    /// Sanitized data (read-only view).
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Canonical JSON string used for hashing and JSONB storage.
    pub fn canonical_json(&self) -> &str {
        &self.canonical_json
    }

    /// SHA-256 digest of the canonical JSON representation.
    pub fn content_hash(&self) -> &[u8; 32] {
        &self.content_hash
    }

    pub fn content_hash_hex(&self) -> String {
        hex::encode(self.content_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_addressing_ignores_nulls_and_empties() {
        let m1 = Metadata::new(
            MetadataType::Nip11Info,
            json!({"a": 1, "b": null, "c": {}}),
        )
        .unwrap();
        let m2 = Metadata::new(MetadataType::Nip11Info, json!({"a": 1})).unwrap();
        assert_eq!(m1.content_hash(), m2.content_hash());
        assert_eq!(m1.canonical_json(), r#"{"a":1}"#);
    }

    #[test]
    fn test_content_addressing_ignores_key_order() {
        let m1 = Metadata::new(MetadataType::Nip66Rtt, json!({"rtt_open": 10, "rtt_read": 20}))
            .unwrap();
        let m2 = Metadata::new(MetadataType::Nip66Rtt, json!({"rtt_read": 20, "rtt_open": 10}))
            .unwrap();
        assert_eq!(m1.content_hash(), m2.content_hash());
    }

    #[test]
    fn test_different_data_different_hash() {
        let m1 = Metadata::new(MetadataType::Nip11Info, json!({"name": "a"})).unwrap();
        let m2 = Metadata::new(MetadataType::Nip11Info, json!({"name": "b"})).unwrap();
        assert_ne!(m1.content_hash(), m2.content_hash());
    }

    #[test]
    fn test_hash_is_sha256_of_canonical_json() {
        let m = Metadata::new(MetadataType::Nip11Info, json!({"name": "relay"})).unwrap();
        let expected: [u8; 32] = Sha256::digest(m.canonical_json().as_bytes()).into();
        assert_eq!(m.content_hash(), &expected);
        assert_eq!(m.content_hash_hex().len(), 64);
    }

    #[test]
    fn test_null_bytes_rejected() {
        let err = Metadata::new(MetadataType::Nip11Info, json!({"name": "x\0y"})).unwrap_err();
        assert!(matches!(err, BigBrotrError::ModelValidation(_)));
    }

    #[test]
    fn test_type_strings() {
        assert_eq!(MetadataType::Nip11Info.as_str(), "nip11_info");
        assert_eq!(MetadataType::Nip66Http.as_str(), "nip66_http");
    }
}
