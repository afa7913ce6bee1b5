//! NIP-66 HTTP check: `Server` and `X-Powered-By` headers captured from
//! the WebSocket upgrade response, not from a separate HTTP request.
//! Works on every network; overlays need a proxy.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::models::relay::Relay;
use crate::nips::{Probe, ProbeLogs, put_opt};
use crate::transport;

pub async fn execute(
    relay: &Relay,
    proxy_url: Option<&str>,
    timeout: Duration,
    allow_insecure: bool,
) -> Probe {
    tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "http_testing");

    if relay.network.is_overlay() && proxy_url.is_none() {
        return Probe {
            data: Value::Object(Map::new()),
            logs: ProbeLogs::fail(format!(
                "overlay network {} requires proxy",
                relay.network
            )),
        };
    }

    let session = match transport::connect_ws(relay, proxy_url, timeout, allow_insecure).await {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(
                target: "bigbrotr::nips::nip66",
                relay = %relay.url,
                error = %e,
                "http_error"
            );
            return Probe {
                data: Value::Object(Map::new()),
                logs: ProbeLogs::fail(e.to_string()),
            };
        }
    };

    let mut data = Map::new();
    put_opt(&mut data, "http_server", session.server_header.clone());
    put_opt(&mut data, "http_powered_by", session.powered_by_header.clone());
    session.close().await;

    if data.is_empty() {
        tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "http_no_data");
        return Probe {
            data: Value::Object(data),
            logs: ProbeLogs::fail("no HTTP headers captured"),
        };
    }

    tracing::debug!(
        target: "bigbrotr::nips::nip66",
        relay = %relay.url,
        server = ?data.get("http_server"),
        "http_completed"
    );
    Probe {
        data: Value::Object(data),
        logs: ProbeLogs::ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overlay_without_proxy_fails() {
        let relay = Relay::parse("ws://abcdef.loki").unwrap();
        let probe = execute(&relay, None, Duration::from_millis(100), true).await;
        assert!(!probe.succeeded());
        assert!(
            probe
                .logs
                .reason
                .as_deref()
                .unwrap()
                .contains("requires proxy")
        );
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails_with_reason() {
        let relay = Relay::parse("wss://192.0.32.10:9").unwrap();
        let probe = execute(&relay, None, Duration::from_millis(300), true).await;
        assert!(!probe.succeeded());
        assert!(probe.logs.reason.is_some());
    }
}
