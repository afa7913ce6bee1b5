//! Immutable Nostr event wrapper with database serialization.
//!
//! Wraps [`nostr_sdk::Event`] with null-byte validation and a
//! pre-computed database parameter row, so an event that cannot be
//! stored never escapes the constructor.

use nostr_sdk::prelude::*;
use serde_json::json;

use crate::error::{BigBrotrError, Result};

/// Positional parameters for the `event_insert` stored procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDbParams {
    pub id: Vec<u8>,
    pub pubkey: Vec<u8>,
    pub created_at: i64,
    pub kind: i32,
    pub tags: String,
    pub content: String,
    pub sig: Vec<u8>,
}

/// A validated Nostr event ready for persistence.
///
/// Content and tag values are checked for null bytes (PostgreSQL TEXT
/// columns reject them) and the database parameter row is computed
/// eagerly at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    inner: nostr_sdk::Event,
    db_params: EventDbParams,
}

impl Event {
    pub fn new(inner: nostr_sdk::Event) -> Result<Self> {
        let short_id = &inner.id.to_hex()[..16];

        if inner.content.contains('\0') {
            return Err(BigBrotrError::ModelValidation(format!(
                "event {short_id}... content contains null bytes"
            )));
        }
        for tag in inner.tags.iter() {
            if tag.as_slice().iter().any(|value| value.contains('\0')) {
                return Err(BigBrotrError::ModelValidation(format!(
                    "event {short_id}... tags contain null bytes"
                )));
            }
        }

        let db_params = Self::compute_db_params(&inner)?;
        Ok(Self { inner, db_params })
    }

    fn compute_db_params(inner: &nostr_sdk::Event) -> Result<EventDbParams> {
        let tags: Vec<Vec<String>> = inner
            .tags
            .iter()
            .map(|tag| tag.as_slice().to_vec())
            .collect();

        Ok(EventDbParams {
            id: hex::decode(inner.id.to_hex())
                .map_err(|e| BigBrotrError::ModelValidation(e.to_string()))?,
            pubkey: hex::decode(inner.pubkey.to_hex())
                .map_err(|e| BigBrotrError::ModelValidation(e.to_string()))?,
            created_at: inner.created_at.as_u64() as i64,
            kind: i32::from(inner.kind.as_u16()),
            tags: serde_json::to_string(&tags)?,
            content: inner.content.clone(),
            sig: hex::decode(inner.sig.to_string())
                .map_err(|e| BigBrotrError::ModelValidation(e.to_string()))?,
        })
    }

    pub fn inner(&self) -> &nostr_sdk::Event {
        &self.inner
    }

    pub fn id_hex(&self) -> String {
        self.inner.id.to_hex()
    }

    pub fn kind(&self) -> u16 {
        self.inner.kind.as_u16()
    }

    pub fn created_at(&self) -> i64 {
        self.inner.created_at.as_u64() as i64
    }

    pub fn db_params(&self) -> &EventDbParams {
        &self.db_params
    }

    /// Reconstruct an [`Event`] from stored database fields.
    ///
    /// The binary columns are rendered back into the SDK's JSON form so
    /// the reconstruction passes through the same parser as wire events.
    pub fn from_db_params(params: &EventDbParams) -> Result<Self> {
        let tags: Vec<Vec<String>> = serde_json::from_str(&params.tags)?;
        let event_json = json!({
            "id": hex::encode(&params.id),
            "pubkey": hex::encode(&params.pubkey),
            "created_at": params.created_at,
            "kind": params.kind,
            "tags": tags,
            "content": params.content,
            "sig": hex::encode(&params.sig),
        });
        let inner = nostr_sdk::Event::from_json(event_json.to_string())?;
        Self::new(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_event(content: &str) -> nostr_sdk::Event {
        let keys = Keys::generate();
        EventBuilder::text_note(content)
            .tags([Tag::custom(
                TagKind::custom("r"),
                ["wss://relay.example.com"],
            )])
            .sign_with_keys(&keys)
            .unwrap()
    }

    #[test]
    fn test_db_roundtrip_is_lossless() {
        let event = Event::new(signed_event("hello bigbrotr")).unwrap();
        let restored = Event::from_db_params(event.db_params()).unwrap();
        assert_eq!(event, restored);
        assert_eq!(event.inner(), restored.inner());
    }

    #[test]
    fn test_db_params_shapes() {
        let event = Event::new(signed_event("shapes")).unwrap();
        let params = event.db_params();
        assert_eq!(params.id.len(), 32);
        assert_eq!(params.pubkey.len(), 32);
        assert_eq!(params.sig.len(), 64);
        assert_eq!(params.kind, 1);
        let tags: Vec<Vec<String>> = serde_json::from_str(&params.tags).unwrap();
        assert_eq!(tags[0][0], "r");
    }

    #[test]
    fn test_null_bytes_in_content_rejected() {
        let err = Event::new(signed_event("bad\0content")).unwrap_err();
        assert!(matches!(err, BigBrotrError::ModelValidation(_)));
    }

    #[test]
    fn test_null_bytes_in_tags_rejected() {
        let keys = Keys::generate();
        let inner = EventBuilder::text_note("fine")
            .tags([Tag::custom(TagKind::custom("r"), ["bad\0tag"])])
            .sign_with_keys(&keys)
            .unwrap();
        let err = Event::new(inner).unwrap_err();
        assert!(matches!(err, BigBrotrError::ModelValidation(_)));
    }

    #[test]
    fn test_signature_survives_roundtrip() {
        let event = Event::new(signed_event("verify me")).unwrap();
        let restored = Event::from_db_params(event.db_params()).unwrap();
        assert!(restored.inner().verify().is_ok());
    }
}
