//! Relay transport: raw WebSocket sessions, the Nostr protocol probe,
//! bounded event fetching with NIP-42 auth, and event broadcasting.
//!
//! The validator, monitor and synchronizer talk to relays through this
//! module. Connections run directly for clearnet or through a SOCKS5
//! proxy for overlay networks; TLS is terminated here so the WebSocket
//! upgrade response (and its `Server` headers) stays observable.
//! Publishing to the configured monitor relays goes through the
//! nostr-sdk client pool instead, which handles fan-out and retries.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nostr_sdk::prelude::*;
use once_cell::sync::Lazy;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, client_async};

use crate::error::{BigBrotrError, Result};
use crate::models::relay::Relay;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// One live WebSocket connection to a relay, plus the identification
/// headers captured from the upgrade response.
pub struct WsSession {
    stream: WebSocketStream<Box<dyn AsyncStream>>,
    pub relay_url: String,
    pub server_header: Option<String>,
    pub powered_by_header: Option<String>,
}

impl std::fmt::Debug for WsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSession")
            .field("relay_url", &self.relay_url)
            .field("server_header", &self.server_header)
            .field("powered_by_header", &self.powered_by_header)
            .finish()
    }
}

/// Parsed relay-to-client wire message. Event payloads stay as raw JSON
/// so callers decide how strictly to parse them.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Event { subscription_id: String, payload: Value },
    Eose { subscription_id: String },
    Ok { event_id: String, accepted: bool, message: String },
    Closed { subscription_id: String, message: String },
    Notice { message: String },
    Auth { challenge: String },
    Unknown,
}

pub fn parse_wire(text: &str) -> WireMessage {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) else {
        return WireMessage::Unknown;
    };
    let verb = items.first().and_then(Value::as_str).unwrap_or_default();
    let str_at = |i: usize| -> String {
        items
            .get(i)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    match verb {
        "EVENT" if items.len() >= 3 => WireMessage::Event {
            subscription_id: str_at(1),
            payload: items[2].clone(),
        },
        "EOSE" if items.len() >= 2 => WireMessage::Eose {
            subscription_id: str_at(1),
        },
        "OK" if items.len() >= 3 => WireMessage::Ok {
            event_id: str_at(1),
            accepted: items.get(2).and_then(Value::as_bool).unwrap_or(false),
            message: str_at(3),
        },
        "CLOSED" if items.len() >= 2 => WireMessage::Closed {
            subscription_id: str_at(1),
            message: str_at(2),
        },
        "NOTICE" => WireMessage::Notice { message: str_at(1) },
        "AUTH" if items.len() >= 2 => WireMessage::Auth {
            challenge: str_at(1),
        },
        _ => WireMessage::Unknown,
    }
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

static TLS_VERIFYING: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

static TLS_INSECURE: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let verifier = danger::NoVerification::new();
    Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth(),
    )
});

mod danger {
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Certificate verifier that accepts any chain. Used for the SSL
    /// probe's extraction pass and for overlay networks where the proxy
    /// provides the encryption.
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(tokio_rustls::rustls::crypto::aws_lc_rs::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

pub fn tls_config(insecure: bool) -> Arc<ClientConfig> {
    if insecure {
        TLS_INSECURE.clone()
    } else {
        TLS_VERIFYING.clone()
    }
}

/// `socks5://host:port` (or `socks5h://`) → host and port.
fn parse_proxy(proxy_url: &str) -> Result<(String, u16)> {
    let parsed = url::Url::parse(proxy_url)
        .map_err(|e| BigBrotrError::Configuration(format!("invalid proxy URL: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| BigBrotrError::Configuration("proxy URL has no host".to_string()))?
        .to_string();
    let port = parsed
        .port()
        .ok_or_else(|| BigBrotrError::Configuration("proxy URL has no port".to_string()))?;
    Ok((host, port))
}

// ---------------------------------------------------------------------------
// Connecting
// ---------------------------------------------------------------------------

/// Open a WebSocket to the relay, optionally through a SOCKS5 proxy,
/// and capture the upgrade-response identification headers.
///
/// Overlay relays must come with a proxy; hostname resolution for them
/// happens proxy-side. The whole dial (TCP, TLS, upgrade) is bounded by
/// `timeout`.
pub async fn connect_ws(
    relay: &Relay,
    proxy_url: Option<&str>,
    timeout: Duration,
    insecure: bool,
) -> Result<WsSession> {
    if relay.network.is_overlay() && proxy_url.is_none() {
        return Err(BigBrotrError::Configuration(format!(
            "overlay network {} requires a proxy",
            relay.network
        )));
    }

    tokio::time::timeout(timeout, connect_ws_inner(relay, proxy_url, insecure))
        .await
        .map_err(|_| BigBrotrError::Timeout(format!("connect {}", relay.url)))?
}

async fn connect_ws_inner(
    relay: &Relay,
    proxy_url: Option<&str>,
    insecure: bool,
) -> Result<WsSession> {
    let port = relay
        .port
        .unwrap_or(if relay.scheme == "wss" { 443 } else { 80 });

    let tcp: Box<dyn AsyncStream> = match proxy_url {
        Some(proxy) => {
            let (proxy_host, proxy_port) = parse_proxy(proxy)?;
            let stream =
                Socks5Stream::connect((proxy_host.as_str(), proxy_port), (relay.host.as_str(), port))
                    .await?;
            Box::new(stream)
        }
        None => Box::new(TcpStream::connect((relay.host.as_str(), port)).await?),
    };

    let stream: Box<dyn AsyncStream> = if relay.scheme == "wss" {
        // Overlay encryption comes from the proxy; clearnet verifies
        // unless the caller opted out.
        let config = tls_config(insecure || relay.network.is_overlay());
        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(relay.host.clone())
            .map_err(|e| BigBrotrError::Configuration(format!("invalid TLS name: {e}")))?;
        Box::new(connector.connect(server_name, tcp).await?)
    } else {
        tcp
    };

    let (ws, response) = client_async(relay.url.as_str(), stream).await?;

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    Ok(WsSession {
        stream: ws,
        relay_url: relay.url.clone(),
        server_header: header("server"),
        powered_by_header: header("x-powered-by"),
    })
}

impl WsSession {
    pub async fn send_json(&mut self, payload: &Value) -> Result<()> {
        self.stream
            .send(Message::Text(payload.to_string()))
            .await?;
        Ok(())
    }

    /// Next protocol message, skipping pings and binary frames. Returns
    /// `None` when the peer closed the connection.
    pub async fn next_wire(&mut self, timeout: Duration) -> Result<Option<WireMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .map_err(|_| BigBrotrError::Timeout(format!("read {}", self.relay_url)))?;
            match frame {
                Some(Ok(Message::Text(text))) => return Ok(Some(parse_wire(&text))),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

// ---------------------------------------------------------------------------
// Protocol operations
// ---------------------------------------------------------------------------

fn new_subscription_id() -> String {
    format!("bigbrotr-{:08x}", rand::random::<u32>())
}

/// Nostr protocol check: a relay is valid iff it answers a REQ with at
/// least one of EOSE, EVENT, NOTICE or AUTH before closing.
pub async fn probe_relay(
    relay: &Relay,
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<bool> {
    let mut session = connect_ws(relay, proxy_url, timeout, true).await?;
    let sub_id = new_subscription_id();
    session
        .send_json(&json!(["REQ", sub_id, {"limit": 1}]))
        .await?;

    let deadline = tokio::time::Instant::now() + timeout;
    let valid = loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break false;
        }
        match session.next_wire(remaining).await {
            Ok(Some(
                WireMessage::Event { .. }
                | WireMessage::Eose { .. }
                | WireMessage::Notice { .. }
                | WireMessage::Auth { .. },
            )) => break true,
            Ok(Some(_)) => continue,
            Ok(None) => break false,
            Err(BigBrotrError::Timeout(_)) => break false,
            Err(e) => return Err(e),
        }
    };
    session.close().await;
    Ok(valid)
}

/// Outcome of one REQ window against a relay.
pub struct FetchedEvents {
    pub events: Vec<nostr_sdk::Event>,
    pub invalid: u64,
}

/// Subscribe with `filter` and collect events until EOSE.
///
/// Handles NIP-42: an AUTH challenge is answered with a signed kind
/// 22242 event when keys are available, and an `auth-required` CLOSED
/// triggers one re-subscribe. Event payloads that fail to parse are
/// counted, not fatal.
pub async fn fetch_events(
    session: &mut WsSession,
    filter: &Filter,
    keys: Option<&Keys>,
    request_timeout: Duration,
) -> Result<FetchedEvents> {
    let filter_json: Value = serde_json::from_str(&filter.as_json())?;
    let sub_id = new_subscription_id();
    let req = json!(["REQ", sub_id, filter_json]);
    session.send_json(&req).await?;

    let mut events = Vec::new();
    let mut invalid = 0u64;
    let mut authed = false;

    loop {
        match session.next_wire(request_timeout).await? {
            Some(WireMessage::Event {
                subscription_id,
                payload,
            }) if subscription_id == sub_id => {
                match nostr_sdk::Event::from_json(payload.to_string()) {
                    Ok(event) => events.push(event),
                    Err(_) => invalid += 1,
                }
            }
            Some(WireMessage::Eose { subscription_id }) if subscription_id == sub_id => break,
            Some(WireMessage::Auth { challenge }) => {
                if let (Some(keys), false) = (keys, authed) {
                    send_auth(session, keys, &challenge).await?;
                    authed = true;
                }
            }
            Some(WireMessage::Closed {
                subscription_id,
                message,
            }) if subscription_id == sub_id => {
                if authed && message.starts_with("auth-required") {
                    // Challenge answered after the subscription was
                    // rejected; try the window once more.
                    session.send_json(&req).await?;
                    authed = false;
                    continue;
                }
                return Err(BigBrotrError::Other(anyhow::anyhow!(
                    "subscription closed: {message}"
                )));
            }
            Some(_) => continue,
            None => {
                return Err(BigBrotrError::Other(anyhow::anyhow!(
                    "connection closed before EOSE"
                )));
            }
        }
    }

    session.send_json(&json!(["CLOSE", sub_id])).await.ok();
    Ok(FetchedEvents { events, invalid })
}

async fn send_auth(session: &mut WsSession, keys: &Keys, challenge: &str) -> Result<()> {
    let relay_url = RelayUrl::parse(&session.relay_url)?;
    let auth_event = EventBuilder::auth(challenge, relay_url).sign_with_keys(keys)?;
    let payload: Value = serde_json::from_str(&auth_event.as_json())?;
    session.send_json(&json!(["AUTH", payload])).await
}

/// Publish a signed event and wait for the relay's OK verdict.
pub async fn publish_event(
    session: &mut WsSession,
    event: &nostr_sdk::Event,
    keys: Option<&Keys>,
    request_timeout: Duration,
) -> Result<(bool, Option<String>)> {
    let payload: Value = serde_json::from_str(&event.as_json())?;
    let wire = json!(["EVENT", payload]);
    session.send_json(&wire).await?;

    let event_id = event.id.to_hex();
    let mut authed = false;
    loop {
        match session.next_wire(request_timeout).await? {
            Some(WireMessage::Ok {
                event_id: acked,
                accepted,
                message,
            }) if acked == event_id => {
                if !accepted && authed && message.starts_with("auth-required") {
                    session.send_json(&wire).await?;
                    authed = false;
                    continue;
                }
                let reason = if message.is_empty() {
                    None
                } else {
                    Some(message)
                };
                return Ok((accepted, reason));
            }
            Some(WireMessage::Auth { challenge }) => {
                if let (Some(keys), false) = (keys, authed) {
                    send_auth(session, keys, &challenge).await?;
                    authed = true;
                }
            }
            Some(_) => continue,
            None => {
                return Err(BigBrotrError::Other(anyhow::anyhow!(
                    "connection closed before OK"
                )));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcasting (nostr-sdk client pool)
// ---------------------------------------------------------------------------

/// Send signed events to every relay in the list. Partial success is
/// acceptable; returns the number of events accepted by at least one
/// relay.
pub async fn broadcast_events(
    events: &[nostr_sdk::Event],
    relay_urls: &[String],
    timeout: Duration,
) -> Result<usize> {
    if events.is_empty() || relay_urls.is_empty() {
        return Ok(0);
    }

    let targets: Vec<RelayUrl> = relay_urls
        .iter()
        .map(|url| RelayUrl::parse(url))
        .collect::<std::result::Result<_, _>>()?;

    let client = Client::default();
    for url in &targets {
        client.add_relay(url.clone()).await?;
    }
    client.connect().await;

    let mut sent = 0usize;
    for event in events {
        match tokio::time::timeout(timeout, client.send_event_to(targets.clone(), event)).await {
            Ok(Ok(output)) => {
                if !output.success.is_empty() {
                    sent += 1;
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(
                    target: "bigbrotr::transport",
                    event_id = %event.id,
                    error = %e,
                    "broadcast_event_failed"
                );
            }
            Err(_) => {
                tracing::debug!(
                    target: "bigbrotr::transport",
                    event_id = %event.id,
                    "broadcast_event_timeout"
                );
            }
        }
    }

    client.disconnect().await;
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod wire_tests {
        use super::*;

        #[test]
        fn test_parse_eose_and_notice() {
            assert_eq!(
                parse_wire(r#"["EOSE","sub1"]"#),
                WireMessage::Eose {
                    subscription_id: "sub1".to_string()
                }
            );
            assert_eq!(
                parse_wire(r#"["NOTICE","slow down"]"#),
                WireMessage::Notice {
                    message: "slow down".to_string()
                }
            );
        }

        #[test]
        fn test_parse_ok_and_closed() {
            assert_eq!(
                parse_wire(r#"["OK","abcd",true,""]"#),
                WireMessage::Ok {
                    event_id: "abcd".to_string(),
                    accepted: true,
                    message: String::new()
                }
            );
            assert_eq!(
                parse_wire(r#"["CLOSED","sub1","auth-required: do auth"]"#),
                WireMessage::Closed {
                    subscription_id: "sub1".to_string(),
                    message: "auth-required: do auth".to_string()
                }
            );
        }

        #[test]
        fn test_parse_auth_and_event() {
            assert_eq!(
                parse_wire(r#"["AUTH","challenge-string"]"#),
                WireMessage::Auth {
                    challenge: "challenge-string".to_string()
                }
            );
            match parse_wire(r#"["EVENT","sub1",{"kind":1}]"#) {
                WireMessage::Event {
                    subscription_id,
                    payload,
                } => {
                    assert_eq!(subscription_id, "sub1");
                    assert_eq!(payload["kind"], 1);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        #[test]
        fn test_parse_garbage_is_unknown() {
            assert_eq!(parse_wire("not json"), WireMessage::Unknown);
            assert_eq!(parse_wire(r#"{"not":"array"}"#), WireMessage::Unknown);
            assert_eq!(parse_wire(r#"["WHAT"]"#), WireMessage::Unknown);
            assert_eq!(parse_wire(r#"["EVENT","missing payload"]"#), WireMessage::Unknown);
        }
    }

    mod proxy_tests {
        use super::*;

        #[test]
        fn test_parse_proxy() {
            assert_eq!(
                parse_proxy("socks5h://127.0.0.1:9050").unwrap(),
                ("127.0.0.1".to_string(), 9050)
            );
            assert!(parse_proxy("127.0.0.1").is_err());
            assert!(parse_proxy("socks5://host-without-port").is_err());
        }

        #[tokio::test]
        async fn test_overlay_without_proxy_rejected() {
            let relay = Relay::parse("ws://abcdef.onion").unwrap();
            let err = connect_ws(&relay, None, Duration::from_millis(100), true)
                .await
                .unwrap_err();
            assert!(matches!(err, BigBrotrError::Configuration(_)));
        }

        #[test]
        fn test_subscription_ids_are_unique() {
            let a = new_subscription_id();
            let b = new_subscription_id();
            assert_ne!(a, b);
            assert!(a.starts_with("bigbrotr-"));
        }
    }
}
