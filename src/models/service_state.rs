//! Typed rows of the `service_state` table.
//!
//! Every piece of mutable operational state outside the relay, event
//! and metadata tables lives here: validation candidates, per-relay
//! cursors, checkpoints, publication markers and monitoring markers.
//! Each row is keyed by `(service_name, state_type, state_key)` and
//! upserts replace the full value atomically.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BigBrotrError, Result};
use crate::models::canonical::canonical_json;

/// Services that own slices of the state-store namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Seeder,
    Finder,
    Validator,
    Monitor,
    Synchronizer,
}

impl ServiceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Seeder => "seeder",
            ServiceName::Finder => "finder",
            ServiceName::Validator => "validator",
            ServiceName::Monitor => "monitor",
            ServiceName::Synchronizer => "synchronizer",
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminator for the kind of state a row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    /// A discovered relay URL awaiting validation (owned by the validator).
    Candidate,
    /// A per-relay progress marker (finder, synchronizer).
    Cursor,
    /// Per-relay last-check timestamp (monitor).
    Checkpoint,
    /// Last-publication timestamps for kind 0 / 10166 events (monitor).
    Publication,
    /// Per-relay recently-checked marker within one interval (monitor).
    Monitoring,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Candidate => "candidate",
            StateType::Cursor => "cursor",
            StateType::Checkpoint => "checkpoint",
            StateType::Publication => "publication",
            StateType::Monitoring => "monitoring",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row in the `service_state` table.
///
/// The value is sanitized with the canonical JSON rules at construction
/// and pre-rendered into the string handed to the JSONB codec, so rows
/// with null bytes or non-mapping values never reach the database.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceState {
    pub service_name: ServiceName,
    pub state_type: StateType,
    pub state_key: String,
    state_value: Value,
    json_value: String,
    pub updated_at: i64,
}

impl ServiceState {
    pub fn new(
        service_name: ServiceName,
        state_type: StateType,
        state_key: impl Into<String>,
        state_value: Value,
        updated_at: i64,
    ) -> Result<Self> {
        let state_key = state_key.into();
        if state_key.is_empty() {
            return Err(BigBrotrError::ModelValidation(
                "state_key must not be empty".to_string(),
            ));
        }
        if state_key.contains('\0') {
            return Err(BigBrotrError::ModelValidation(
                "state_key contains null bytes".to_string(),
            ));
        }
        if !state_value.is_object() {
            return Err(BigBrotrError::ModelValidation(
                "state_value must be a mapping".to_string(),
            ));
        }
        if updated_at < 0 {
            return Err(BigBrotrError::ModelValidation(
                "updated_at must be non-negative".to_string(),
            ));
        }

        let (sanitized, rendered) = canonical_json(&state_value, "state_value")
            .map_err(|e| BigBrotrError::ModelValidation(e.to_string()))?;

        Ok(Self {
            service_name,
            state_type,
            state_key,
            state_value: sanitized,
            json_value: rendered,
            updated_at,
        })
    }

    /// Sanitized value (read-only view).
    pub fn state_value(&self) -> &Value {
        &self.state_value
    }

    /// Pre-serialized JSON handed verbatim to the JSONB codec.
    pub fn json_value(&self) -> &str {
        &self.json_value
    }

    /// Convenience accessor for integer fields of the value mapping.
    pub fn value_i64(&self, key: &str) -> Option<i64> {
        self.state_value.get(key).and_then(Value::as_i64)
    }

    /// Convenience accessor for string fields of the value mapping.
    pub fn value_str(&self, key: &str) -> Option<&str> {
        self.state_value.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_sanitizes_value() {
        let state = ServiceState::new(
            ServiceName::Synchronizer,
            StateType::Cursor,
            "wss://relay.example.com",
            json!({"last_synced_at": 1_700_000_000, "noise": null}),
            1_700_000_001,
        )
        .unwrap();
        assert_eq!(state.json_value(), r#"{"last_synced_at":1700000000}"#);
        assert_eq!(state.value_i64("last_synced_at"), Some(1_700_000_000));
    }

    #[test]
    fn test_empty_key_rejected() {
        let err = ServiceState::new(
            ServiceName::Finder,
            StateType::Cursor,
            "",
            json!({}),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, BigBrotrError::ModelValidation(_)));
    }

    #[test]
    fn test_non_mapping_value_rejected() {
        let err = ServiceState::new(
            ServiceName::Validator,
            StateType::Candidate,
            "wss://relay.example.com",
            json!([1, 2, 3]),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, BigBrotrError::ModelValidation(_)));
    }

    #[test]
    fn test_negative_timestamp_rejected() {
        let err = ServiceState::new(
            ServiceName::Monitor,
            StateType::Monitoring,
            "wss://relay.example.com",
            json!({"monitored_at": 1}),
            -1,
        )
        .unwrap_err();
        assert!(matches!(err, BigBrotrError::ModelValidation(_)));
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!(ServiceName::Validator.as_str(), "validator");
        assert_eq!(StateType::Publication.as_str(), "publication");
    }
}
