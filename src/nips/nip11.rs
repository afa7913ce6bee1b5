//! NIP-11 relay information document fetch.
//!
//! Fetches the info document over HTTP(S) with
//! `Accept: application/nostr+json`, enforces the Content-Type and a
//! size cap with a streamed bounded read, and keeps only fields of the
//! documented shape so malformed documents degrade instead of failing.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::relay::Relay;
use crate::nips::{Probe, ProbeLogs};

const ACCEPT_HEADER: &str = "application/nostr+json";

const STR_FIELDS: &[&str] = &[
    "name",
    "description",
    "banner",
    "icon",
    "pubkey",
    "self",
    "contact",
    "software",
    "version",
    "privacy_policy",
    "terms_of_service",
    "posting_policy",
    "payments_url",
];

const STR_LIST_FIELDS: &[&str] = &["relay_countries", "language_tags", "tags"];

const LIMITATION_INT_FIELDS: &[&str] = &[
    "max_message_length",
    "max_subscriptions",
    "max_limit",
    "max_subid_length",
    "max_event_tags",
    "max_content_length",
    "min_pow_difficulty",
    "created_at_lower_limit",
    "created_at_upper_limit",
    "default_limit",
];

const LIMITATION_BOOL_FIELDS: &[&str] = &[
    "auth_required",
    "payment_required",
    "restricted_writes",
];

/// A fetched (or failed) NIP-11 information document.
///
/// `fetch` never errors: inspect `probe.logs.success`.
#[derive(Debug, Clone, PartialEq)]
pub struct Nip11Info {
    pub probe: Probe,
}

#[derive(Debug, Clone, Copy)]
pub struct Nip11Options {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_size: usize,
    pub allow_insecure: bool,
}

impl Default for Nip11Options {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_size: 1024 * 1024,
            allow_insecure: true,
        }
    }
}

impl Nip11Info {
    pub async fn fetch(relay: &Relay, proxy_url: Option<&str>, options: Nip11Options) -> Self {
        // Overlay relays get their transport security from the proxy,
        // so certificate verification is off for them from the start.
        let insecure_first = relay.network.is_overlay();

        let result = Self::fetch_once(relay, proxy_url, options, insecure_first).await;
        let result = match result {
            Err(e) if options.allow_insecure && !insecure_first && relay.scheme == "wss" => {
                tracing::debug!(
                    target: "bigbrotr::nips::nip11",
                    relay = %relay.url,
                    error = %e,
                    "nip11_tls_fallback"
                );
                Self::fetch_once(relay, proxy_url, options, true).await
            }
            other => other,
        };

        match result {
            Ok(data) => {
                tracing::debug!(
                    target: "bigbrotr::nips::nip11",
                    relay = %relay.url,
                    name = data.get("name").and_then(serde_json::Value::as_str),
                    "nip11_fetched"
                );
                Self {
                    probe: Probe {
                        data,
                        logs: ProbeLogs::ok(),
                    },
                }
            }
            Err(e) => {
                tracing::debug!(
                    target: "bigbrotr::nips::nip11",
                    relay = %relay.url,
                    error = %e,
                    "nip11_failed"
                );
                Self {
                    probe: Probe {
                        data: Value::Object(Map::new()),
                        logs: ProbeLogs::fail(e.to_string()),
                    },
                }
            }
        }
    }

    async fn fetch_once(
        relay: &Relay,
        proxy_url: Option<&str>,
        options: Nip11Options,
        insecure: bool,
    ) -> Result<Value> {
        let mut builder = reqwest::Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout.min(options.timeout))
            .danger_accept_invalid_certs(insecure);
        if let Some(proxy) = proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;

        let response = client
            .get(relay.http_url())
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(crate::error::BigBrotrError::Other(anyhow::anyhow!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if content_type != "application/nostr+json" && content_type != "application/json" {
            return Err(crate::error::BigBrotrError::Other(anyhow::anyhow!(
                "invalid Content-Type: {content_type}"
            )));
        }

        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > options.max_size {
                return Err(crate::error::BigBrotrError::Other(anyhow::anyhow!(
                    "response too large: > {} bytes",
                    options.max_size
                )));
            }
            body.extend_from_slice(&chunk);
        }

        let raw: Value = serde_json::from_slice(&body)?;
        if !raw.is_object() {
            return Err(crate::error::BigBrotrError::Other(anyhow::anyhow!(
                "expected a JSON object"
            )));
        }

        Ok(parse_document(&raw))
    }

    // -------------------------------------------------------------------
    // Typed accessors over the filtered document
    // -------------------------------------------------------------------

    pub fn succeeded(&self) -> bool {
        self.probe.succeeded()
    }

    pub fn data(&self) -> &Value {
        &self.probe.data
    }

    pub fn supported_nips(&self) -> Vec<i64> {
        self.probe
            .data
            .get("supported_nips")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default()
    }

    fn limitation_field(&self, key: &str) -> Option<&Value> {
        self.probe.data.get("limitation").and_then(|l| l.get(key))
    }

    pub fn min_pow_difficulty(&self) -> Option<u8> {
        self.limitation_field("min_pow_difficulty")
            .and_then(Value::as_u64)
            .and_then(|v| u8::try_from(v).ok())
    }

    pub fn auth_required(&self) -> Option<bool> {
        self.limitation_field("auth_required").and_then(Value::as_bool)
    }

    pub fn payment_required(&self) -> Option<bool> {
        self.limitation_field("payment_required")
            .and_then(Value::as_bool)
    }

    fn str_list(&self, key: &str) -> Vec<String> {
        self.probe
            .data
            .get(key)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.str_list("tags")
    }

    pub fn language_tags(&self) -> Vec<String> {
        self.str_list("language_tags")
    }
}

fn is_plain_int(value: &Value) -> bool {
    value.is_i64() || value.is_u64()
}

/// Keep only documented NIP-11 fields with the documented types.
/// Anything else a relay volunteers is dropped rather than persisted.
pub fn parse_document(raw: &Value) -> Value {
    let mut result = Map::new();
    let Some(doc) = raw.as_object() else {
        return Value::Object(result);
    };

    for key in STR_FIELDS {
        if let Some(value) = doc.get(*key).and_then(Value::as_str) {
            result.insert((*key).to_string(), Value::String(value.to_string()));
        }
    }

    if let Some(nips) = doc.get("supported_nips").and_then(Value::as_array) {
        let ints: Vec<Value> = nips.iter().filter(|v| is_plain_int(v)).cloned().collect();
        if !ints.is_empty() {
            result.insert("supported_nips".to_string(), Value::Array(ints));
        }
    }

    if let Some(limitation) = doc.get("limitation").and_then(Value::as_object) {
        let mut filtered = Map::new();
        for key in LIMITATION_INT_FIELDS {
            if let Some(value) = limitation.get(*key) {
                if is_plain_int(value) {
                    filtered.insert((*key).to_string(), value.clone());
                }
            }
        }
        for key in LIMITATION_BOOL_FIELDS {
            if let Some(value) = limitation.get(*key) {
                if value.is_boolean() {
                    filtered.insert((*key).to_string(), value.clone());
                }
            }
        }
        if !filtered.is_empty() {
            result.insert("limitation".to_string(), Value::Object(filtered));
        }
    }

    if let Some(retention) = doc.get("retention").and_then(Value::as_array) {
        let entries: Vec<Value> = retention.iter().filter_map(parse_retention_entry).collect();
        if !entries.is_empty() {
            result.insert("retention".to_string(), Value::Array(entries));
        }
    }

    if let Some(fees) = doc.get("fees").and_then(Value::as_object) {
        let mut filtered = Map::new();
        for key in ["admission", "subscription", "publication"] {
            if let Some(list) = fees.get(key).and_then(Value::as_array) {
                let entries: Vec<Value> = list.iter().filter_map(parse_fee_entry).collect();
                if !entries.is_empty() {
                    filtered.insert(key.to_string(), Value::Array(entries));
                }
            }
        }
        if !filtered.is_empty() {
            result.insert("fees".to_string(), Value::Object(filtered));
        }
    }

    for key in STR_LIST_FIELDS {
        if let Some(list) = doc.get(*key).and_then(Value::as_array) {
            let strings: Vec<Value> = list.iter().filter(|v| v.is_string()).cloned().collect();
            if !strings.is_empty() {
                result.insert((*key).to_string(), Value::Array(strings));
            }
        }
    }

    Value::Object(result)
}

fn parse_retention_entry(raw: &Value) -> Option<Value> {
    let entry = raw.as_object()?;
    let mut result = Map::new();

    if let Some(kinds) = entry.get("kinds").and_then(Value::as_array) {
        let valid: Vec<Value> = kinds
            .iter()
            .filter(|item| {
                is_plain_int(item)
                    || item
                        .as_array()
                        .is_some_and(|range| range.len() == 2 && range.iter().all(is_plain_int))
            })
            .cloned()
            .collect();
        if !valid.is_empty() {
            result.insert("kinds".to_string(), Value::Array(valid));
        }
    }
    for key in ["time", "count"] {
        if let Some(value) = entry.get(key) {
            if is_plain_int(value) {
                result.insert(key.to_string(), value.clone());
            }
        }
    }

    if result.is_empty() {
        None
    } else {
        Some(Value::Object(result))
    }
}

fn parse_fee_entry(raw: &Value) -> Option<Value> {
    let entry = raw.as_object()?;
    let mut result = Map::new();

    for key in ["amount", "period"] {
        if let Some(value) = entry.get(key) {
            if is_plain_int(value) {
                result.insert(key.to_string(), value.clone());
            }
        }
    }
    if let Some(unit) = entry.get("unit").and_then(Value::as_str) {
        result.insert("unit".to_string(), Value::String(unit.to_string()));
    }
    if let Some(kinds) = entry.get("kinds").and_then(Value::as_array) {
        let ints: Vec<Value> = kinds.iter().filter(|v| is_plain_int(v)).cloned().collect();
        if !ints.is_empty() {
            result.insert("kinds".to_string(), Value::Array(ints));
        }
    }

    if result.is_empty() {
        None
    } else {
        Some(Value::Object(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod parse_tests {
        use super::*;

        #[test]
        fn test_keeps_documented_fields_only() {
            let raw = json!({
                "name": "Test Relay",
                "description": "a relay",
                "supported_nips": [1, 11, "not-a-nip", 66],
                "unknown_field": {"x": 1},
                "limitation": {
                    "max_message_length": 65536,
                    "auth_required": false,
                    "payment_required": "yes",
                    "bogus": 1
                },
                "tags": ["sfw-only", 42],
                "language_tags": ["en"]
            });
            let parsed = parse_document(&raw);
            assert_eq!(parsed["name"], "Test Relay");
            assert_eq!(parsed["supported_nips"], json!([1, 11, 66]));
            assert!(parsed.get("unknown_field").is_none());
            assert_eq!(parsed["limitation"]["max_message_length"], 65536);
            assert_eq!(parsed["limitation"]["auth_required"], false);
            // payment_required had the wrong type and is dropped
            assert!(parsed["limitation"].get("payment_required").is_none());
            assert!(parsed["limitation"].get("bogus").is_none());
            assert_eq!(parsed["tags"], json!(["sfw-only"]));
        }

        #[test]
        fn test_retention_kind_ranges() {
            let raw = json!({
                "retention": [
                    {"kinds": [0, 1, [5, 7], "bad", [1, 2, 3]], "time": 3600},
                    {"count": 100},
                    {"bogus": true}
                ]
            });
            let parsed = parse_document(&raw);
            let retention = parsed["retention"].as_array().unwrap();
            assert_eq!(retention.len(), 2);
            assert_eq!(retention[0]["kinds"], json!([0, 1, [5, 7]]));
            assert_eq!(retention[1]["count"], 100);
        }

        #[test]
        fn test_fees() {
            let raw = json!({
                "fees": {
                    "admission": [{"amount": 1000, "unit": "msats"}],
                    "publication": [{"kinds": [4], "amount": 100, "unit": "msats"}],
                    "subscription": []
                }
            });
            let parsed = parse_document(&raw);
            assert_eq!(parsed["fees"]["admission"][0]["amount"], 1000);
            assert_eq!(parsed["fees"]["publication"][0]["kinds"], json!([4]));
            assert!(parsed["fees"].get("subscription").is_none());
        }

        #[test]
        fn test_non_object_becomes_empty() {
            assert_eq!(parse_document(&json!([1, 2])), json!({}));
            assert_eq!(parse_document(&json!("nope")), json!({}));
        }
    }

    mod fetch_tests {
        use super::*;

        fn test_relay(server_url: &str) -> Relay {
            // mockito binds 127.0.0.1 which the relay model rejects, so
            // fabricate an equivalent clearnet relay pointing at it.
            let port = url::Url::parse(server_url).unwrap().port().unwrap();
            Relay {
                url: format!("ws://127.0.0.1:{port}"),
                network: crate::models::relay::Network::Clearnet,
                scheme: "ws",
                host: "127.0.0.1".to_string(),
                port: Some(port),
                path: None,
                discovered_at: 0,
            }
        }

        #[tokio::test]
        async fn test_fetch_success() {
            let mut server = mockito::Server::new_async().await;
            let mock = server
                .mock("GET", "/")
                .match_header("accept", "application/nostr+json")
                .with_status(200)
                .with_header("content-type", "application/nostr+json")
                .with_body(r#"{"name":"Mock Relay","supported_nips":[1,11]}"#)
                .create_async()
                .await;

            let relay = test_relay(&server.url());
            let info = Nip11Info::fetch(&relay, None, Nip11Options::default()).await;

            mock.assert_async().await;
            assert!(info.succeeded());
            assert_eq!(info.data()["name"], "Mock Relay");
            assert_eq!(info.supported_nips(), vec![1, 11]);
        }

        #[tokio::test]
        async fn test_fetch_rejects_wrong_content_type() {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("GET", "/")
                .with_status(200)
                .with_header("content-type", "text/html")
                .with_body("<html></html>")
                .create_async()
                .await;

            let relay = test_relay(&server.url());
            let info = Nip11Info::fetch(&relay, None, Nip11Options::default()).await;
            assert!(!info.succeeded());
            assert!(
                info.probe
                    .logs
                    .reason
                    .as_deref()
                    .unwrap()
                    .contains("Content-Type")
            );
        }

        #[tokio::test]
        async fn test_fetch_rejects_oversize_body() {
            let mut server = mockito::Server::new_async().await;
            let big = format!(r#"{{"name":"{}"}}"#, "x".repeat(4096));
            server
                .mock("GET", "/")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(big)
                .create_async()
                .await;

            let relay = test_relay(&server.url());
            let options = Nip11Options {
                max_size: 1024,
                ..Nip11Options::default()
            };
            let info = Nip11Info::fetch(&relay, None, options).await;
            assert!(!info.succeeded());
            assert!(
                info.probe
                    .logs
                    .reason
                    .as_deref()
                    .unwrap()
                    .contains("too large")
            );
        }

        #[tokio::test]
        async fn test_fetch_rejects_non_200() {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("GET", "/")
                .with_status(404)
                .create_async()
                .await;

            let relay = test_relay(&server.url());
            let info = Nip11Info::fetch(&relay, None, Nip11Options::default()).await;
            assert!(!info.succeeded());
            assert!(info.probe.logs.reason.as_deref().unwrap().contains("404"));
        }
    }
}
