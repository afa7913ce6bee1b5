//! NIP implementations consumed by the monitor: the NIP-11 information
//! document fetch and the NIP-66 health check suite.
//!
//! Every check produces a data/logs pair. `logs.success` is always
//! present; a failed check always carries a non-empty `reason`. The
//! pair is stored as one content-addressed metadata value of the form
//! `{"data": …, "logs": …}`.

pub mod nip11;
pub mod nip66;

use serde_json::{Value, json};

/// Standard single-phase probe log: `success == true ⇔ reason == None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeLogs {
    pub success: bool,
    pub reason: Option<String>,
}

impl ProbeLogs {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    /// A failure always carries a non-empty reason string.
    pub fn fail(reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        let reason = if reason.is_empty() {
            "unknown error".to_string()
        } else {
            reason
        };
        Self {
            success: false,
            reason: Some(reason),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "success": self.success,
            "reason": self.reason,
        })
    }
}

/// Outcome of one single-phase check: the extracted data fields plus
/// the operation log.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub data: Value,
    pub logs: ProbeLogs,
}

impl Probe {
    pub fn succeeded(&self) -> bool {
        self.logs.success
    }

    /// The metadata value persisted for this check.
    pub fn to_metadata_value(&self) -> Value {
        json!({
            "data": self.data,
            "logs": self.logs.to_value(),
        })
    }
}

/// Insert `key: value` only when the value is present. Keeps probe data
/// free of explicit nulls before sanitization.
pub(crate) fn put_opt<T: Into<Value>>(map: &mut serde_json::Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(v) = value {
        map.insert(key.to_string(), v.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_reason_never_empty() {
        let logs = ProbeLogs::fail("");
        assert!(!logs.success);
        assert_eq!(logs.reason.as_deref(), Some("unknown error"));

        let logs = ProbeLogs::fail("connection refused");
        assert_eq!(logs.reason.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_ok_has_no_reason() {
        let logs = ProbeLogs::ok();
        assert!(logs.success);
        assert!(logs.reason.is_none());
    }

    #[test]
    fn test_metadata_value_shape() {
        let probe = Probe {
            data: json!({"http_server": "nginx"}),
            logs: ProbeLogs::ok(),
        };
        let value = probe.to_metadata_value();
        assert_eq!(value["data"]["http_server"], "nginx");
        assert_eq!(value["logs"]["success"], true);
    }
}
