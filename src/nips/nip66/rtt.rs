//! NIP-66 round-trip time check: connection open, event read, event
//! write latencies in milliseconds.
//!
//! Phases run sequentially against one WebSocket session. If the open
//! phase fails, read and write are marked failed with the same reason
//! (cascading failure) and never attempted.

use std::time::{Duration, Instant};

use nostr_sdk::prelude::*;
use serde_json::{Map, Value, json};

use crate::models::relay::Relay;
use crate::nips::put_opt;
use crate::transport::{self, WireMessage, WsSession};

/// Multi-phase RTT log. `open_success` is always known; read and write
/// stay `None` only for internal intermediate states; a finished probe
/// always has all three resolved, with read/write forced to `false`
/// when open failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttLogs {
    pub open_success: bool,
    pub open_reason: Option<String>,
    pub read_success: Option<bool>,
    pub read_reason: Option<String>,
    pub write_success: Option<bool>,
    pub write_reason: Option<String>,
}

impl RttLogs {
    /// Open failed: every later phase fails with the same reason.
    pub fn cascade_failure(reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        let reason = if reason.is_empty() {
            "unknown error".to_string()
        } else {
            reason
        };
        Self {
            open_success: false,
            open_reason: Some(reason.clone()),
            read_success: Some(false),
            read_reason: Some(reason.clone()),
            write_success: Some(false),
            write_reason: Some(reason),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("open_success".to_string(), self.open_success.into());
        put_opt(&mut map, "open_reason", self.open_reason.clone());
        put_opt(&mut map, "read_success", self.read_success);
        put_opt(&mut map, "read_reason", self.read_reason.clone());
        put_opt(&mut map, "write_success", self.write_success);
        put_opt(&mut map, "write_reason", self.write_reason.clone());
        Value::Object(map)
    }

    /// Phase consistency: `success=true ⇔ reason=None` per phase, and a
    /// failed open forces failed read and write.
    pub fn is_consistent(&self) -> bool {
        let phase_ok = |success: Option<bool>, reason: &Option<String>| match success {
            Some(true) => reason.is_none(),
            Some(false) => reason.is_some(),
            None => reason.is_none(),
        };
        if self.open_success != self.open_reason.is_none() {
            return false;
        }
        if !phase_ok(self.read_success, &self.read_reason)
            || !phase_ok(self.write_success, &self.write_reason)
        {
            return false;
        }
        if !self.open_success
            && (self.read_success != Some(false) || self.write_success != Some(false))
        {
            return false;
        }
        true
    }
}

/// RTT measurement outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct RttProbe {
    pub data: Value,
    pub logs: RttLogs,
}

impl RttProbe {
    pub fn succeeded(&self) -> bool {
        self.logs.open_success
    }

    pub fn to_metadata_value(&self) -> Value {
        json!({
            "data": self.data,
            "logs": self.logs.to_value(),
        })
    }
}

fn millis_since(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

/// Run the three RTT phases against a relay.
///
/// `test_event` is the pre-signed write-test event (NIP-11 proof of
/// work already applied by the caller when required).
pub async fn execute(
    relay: &Relay,
    keys: &Keys,
    test_event: &nostr_sdk::Event,
    proxy_url: Option<&str>,
    timeout: Duration,
    allow_insecure: bool,
) -> RttProbe {
    tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "rtt_started");

    // Phase 1: open
    let open_start = Instant::now();
    let mut session =
        match transport::connect_ws(relay, proxy_url, timeout, allow_insecure).await {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!(
                    target: "bigbrotr::nips::nip66",
                    relay = %relay.url,
                    reason = %e,
                    "rtt_open_failed"
                );
                return RttProbe {
                    data: json!({}),
                    logs: RttLogs::cascade_failure(e.to_string()),
                };
            }
        };
    let rtt_open = millis_since(open_start);

    let mut logs = RttLogs {
        open_success: true,
        open_reason: None,
        read_success: None,
        read_reason: None,
        write_success: None,
        write_reason: None,
    };
    let mut data = Map::new();
    data.insert("rtt_open".to_string(), rtt_open.into());

    // Phase 2: read
    match read_phase(&mut session, keys, timeout).await {
        Ok(rtt_read) => {
            data.insert("rtt_read".to_string(), rtt_read.into());
            logs.read_success = Some(true);
        }
        Err(reason) => {
            logs.read_success = Some(false);
            logs.read_reason = Some(reason);
        }
    }

    // Phase 3: write (publish and verify by id fetch)
    match write_phase(&mut session, keys, test_event, timeout).await {
        Ok(rtt_write) => {
            data.insert("rtt_write".to_string(), rtt_write.into());
            logs.write_success = Some(true);
        }
        Err(reason) => {
            logs.write_success = Some(false);
            logs.write_reason = Some(reason);
        }
    }

    session.close().await;

    tracing::debug!(
        target: "bigbrotr::nips::nip66",
        relay = %relay.url,
        open = logs.open_success,
        read = ?logs.read_success,
        write = ?logs.write_success,
        "rtt_completed"
    );
    RttProbe {
        data: Value::Object(data),
        logs,
    }
}

/// Stream one event (`limit: 1`); latency is the time to the first
/// EVENT frame.
async fn read_phase(
    session: &mut WsSession,
    keys: &Keys,
    timeout: Duration,
) -> std::result::Result<i64, String> {
    let sub_id = format!("rtt-read-{:08x}", rand::random::<u32>());
    let start = Instant::now();
    session
        .send_json(&json!(["REQ", sub_id, {"limit": 1}]))
        .await
        .map_err(|e| e.to_string())?;

    let mut authed = false;
    loop {
        match session.next_wire(timeout).await {
            Ok(Some(WireMessage::Event { subscription_id, .. })) if subscription_id == sub_id => {
                let rtt = millis_since(start);
                session.send_json(&json!(["CLOSE", sub_id])).await.ok();
                return Ok(rtt);
            }
            Ok(Some(WireMessage::Eose { subscription_id })) if subscription_id == sub_id => {
                session.send_json(&json!(["CLOSE", sub_id])).await.ok();
                return Err("no events returned".to_string());
            }
            Ok(Some(WireMessage::Auth { challenge })) if !authed => {
                let relay_url =
                    RelayUrl::parse(&session.relay_url).map_err(|e| e.to_string())?;
                let auth = EventBuilder::auth(challenge, relay_url)
                    .sign_with_keys(keys)
                    .map_err(|e| e.to_string())?;
                let payload: Value =
                    serde_json::from_str(&auth.as_json()).map_err(|e| e.to_string())?;
                session
                    .send_json(&json!(["AUTH", payload]))
                    .await
                    .map_err(|e| e.to_string())?;
                authed = true;
            }
            Ok(Some(WireMessage::Closed { subscription_id, message }))
                if subscription_id == sub_id =>
            {
                return Err(format!("subscription closed: {message}"));
            }
            Ok(Some(_)) => continue,
            Ok(None) => return Err("connection closed".to_string()),
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Publish the test event, then verify it is retrievable by id.
async fn write_phase(
    session: &mut WsSession,
    keys: &Keys,
    test_event: &nostr_sdk::Event,
    timeout: Duration,
) -> std::result::Result<i64, String> {
    let start = Instant::now();
    let (accepted, reason) = transport::publish_event(session, test_event, Some(keys), timeout)
        .await
        .map_err(|e| e.to_string())?;
    let rtt_write = millis_since(start);

    if !accepted {
        return Err(reason.unwrap_or_else(|| "no response from relay".to_string()));
    }

    let verify_filter = Filter::new().id(test_event.id).limit(1);
    match transport::fetch_events(session, &verify_filter, Some(keys), timeout).await {
        Ok(fetched) if fetched.events.iter().any(|e| e.id == test_event.id) => Ok(rtt_write),
        Ok(_) => Err("unverified: accepted but not retrievable".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cascade_failure_marks_all_phases() {
        let logs = RttLogs::cascade_failure("connection refused");
        assert!(!logs.open_success);
        assert_eq!(logs.open_reason.as_deref(), Some("connection refused"));
        assert_eq!(logs.read_success, Some(false));
        assert_eq!(logs.read_reason.as_deref(), Some("connection refused"));
        assert_eq!(logs.write_success, Some(false));
        assert_eq!(logs.write_reason.as_deref(), Some("connection refused"));
        assert!(logs.is_consistent());
    }

    #[test]
    fn test_consistency_checks() {
        let good = RttLogs {
            open_success: true,
            open_reason: None,
            read_success: Some(true),
            read_reason: None,
            write_success: Some(false),
            write_reason: Some("rejected".to_string()),
        };
        assert!(good.is_consistent());

        // success with a reason attached
        let bad = RttLogs {
            read_reason: Some("why".to_string()),
            ..good.clone()
        };
        assert!(!bad.is_consistent());

        // open failed but read claims success
        let bad = RttLogs {
            open_success: false,
            open_reason: Some("down".to_string()),
            read_success: Some(true),
            read_reason: None,
            write_success: Some(false),
            write_reason: Some("down".to_string()),
        };
        assert!(!bad.is_consistent());
    }

    #[test]
    fn test_to_value_skips_absent_phases() {
        let logs = RttLogs {
            open_success: true,
            open_reason: None,
            read_success: None,
            read_reason: None,
            write_success: None,
            write_reason: None,
        };
        let value = logs.to_value();
        assert_eq!(value["open_success"], true);
        assert!(value.get("read_success").is_none());
        assert!(value.get("write_reason").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_relay_cascades() {
        // TEST-NET-2 address range is guaranteed unroutable.
        let relay = Relay::parse("wss://198.51.100.7:7777").unwrap_err();
        // 198.51.100.0/24 is in the private table, so pick a public but
        // closed endpoint instead: parse succeeds, dial fails fast.
        assert!(matches!(
            relay,
            crate::models::relay::RelayUrlError::LocalAddress
        ));

        let relay = Relay::parse("wss://192.0.32.10:9").unwrap();
        let keys = Keys::generate();
        let event = EventBuilder::text_note("rtt probe")
            .sign_with_keys(&keys)
            .unwrap();
        let probe = execute(
            &relay,
            &keys,
            &event,
            None,
            Duration::from_millis(300),
            true,
        )
        .await;
        assert!(!probe.succeeded());
        assert!(probe.logs.is_consistent());
        assert_eq!(probe.logs.read_success, Some(false));
        assert_eq!(probe.logs.write_success, Some(false));
        assert_eq!(probe.logs.open_reason, probe.logs.read_reason);
    }
}
