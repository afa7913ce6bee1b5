//! Junction between a relay and a content-addressed metadata record.

use crate::error::{BigBrotrError, Result};
use crate::models::metadata::Metadata;
use crate::models::relay::Relay;

/// One observation linking a relay to a metadata blob at a point in
/// time. Multiple rows per `(relay, type)` form the monitoring
/// time-series.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMetadata {
    pub relay: Relay,
    pub metadata: Metadata,
    pub generated_at: i64,
}

impl RelayMetadata {
    pub fn new(relay: Relay, metadata: Metadata, generated_at: i64) -> Result<Self> {
        if generated_at < 0 {
            return Err(BigBrotrError::ModelValidation(
                "generated_at must be non-negative".to_string(),
            ));
        }
        Ok(Self {
            relay,
            metadata,
            generated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::MetadataType;
    use serde_json::json;

    #[test]
    fn test_new_binds_relay_and_metadata() {
        let relay = Relay::parse("wss://relay.example.com").unwrap();
        let metadata = Metadata::new(MetadataType::Nip11Info, json!({"name": "r"})).unwrap();
        let rm = RelayMetadata::new(relay, metadata.clone(), 1_700_000_000).unwrap();
        assert_eq!(rm.metadata.content_hash(), metadata.content_hash());
    }

    #[test]
    fn test_negative_generated_at_rejected() {
        let relay = Relay::parse("wss://relay.example.com").unwrap();
        let metadata = Metadata::new(MetadataType::Nip66Dns, json!({})).unwrap();
        assert!(RelayMetadata::new(relay, metadata, -5).is_err());
    }
}
