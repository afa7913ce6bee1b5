//! NIP-66 SSL check: certificate inspection plus chain validation.
//! Clearnet relays only.
//!
//! Two connections are made. The first skips verification so the
//! DER certificate can be read from relays with self-signed or expired
//! chains; the second uses the system trust store and only its success
//! or failure feeds `ssl_valid`.

use std::time::Duration;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use x509_parser::prelude::*;

use crate::models::relay::{Network, Relay};
use crate::nips::{Probe, ProbeLogs, put_opt};
use crate::transport::tls_config;

pub async fn execute(relay: &Relay, timeout: Duration) -> Probe {
    tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "ssl_testing");

    if relay.network != Network::Clearnet {
        return Probe {
            data: Value::Object(Map::new()),
            logs: ProbeLogs::fail(format!("requires clearnet, got {}", relay.network)),
        };
    }

    let port = relay.port.unwrap_or(443);
    let mut data = Map::new();

    match extract_certificate_data(&relay.host, port, timeout).await {
        Ok(extracted) => data.extend(extracted),
        Err(e) => {
            tracing::debug!(
                target: "bigbrotr::nips::nip66",
                relay = %relay.url,
                error = %e,
                "ssl_cert_extraction_failed"
            );
        }
    }

    if data.is_empty() {
        return Probe {
            data: Value::Object(data),
            logs: ProbeLogs::fail("no certificate data extracted"),
        };
    }

    let valid = validate_chain(&relay.host, port, timeout).await;
    data.insert("ssl_valid".to_string(), valid.into());

    tracing::debug!(
        target: "bigbrotr::nips::nip66",
        relay = %relay.url,
        valid,
        "ssl_checked"
    );
    Probe {
        data: Value::Object(data),
        logs: ProbeLogs::ok(),
    }
}

async fn handshake(
    host: &str,
    port: u16,
    timeout: Duration,
    insecure: bool,
) -> std::io::Result<TlsStream<TcpStream>> {
    let do_connect = async {
        let tcp = TcpStream::connect((host, port)).await?;
        let connector = TlsConnector::from(tls_config(insecure));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        connector.connect(server_name, tcp).await
    };
    tokio::time::timeout(timeout, do_connect)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tls handshake timeout"))?
}

/// Read the peer certificate without verification and pull out the
/// fields NIP-66 publishes.
async fn extract_certificate_data(
    host: &str,
    port: u16,
    timeout: Duration,
) -> std::io::Result<Map<String, Value>> {
    let stream = handshake(host, port, timeout, true).await?;
    let (_, connection) = stream.get_ref();

    let mut result = Map::new();

    if let Some(protocol) = connection.protocol_version() {
        result.insert("ssl_protocol".to_string(), format!("{protocol:?}").into());
    }
    if let Some(suite) = connection.negotiated_cipher_suite() {
        result.insert("ssl_cipher".to_string(), format!("{:?}", suite.suite()).into());
    }

    if let Some(certs) = connection.peer_certificates() {
        if let Some(end_entity) = certs.first() {
            let der = end_entity.as_ref();
            result.insert(
                "ssl_fingerprint".to_string(),
                fingerprint_sha256(der).into(),
            );
            if let Ok((_, cert)) = parse_x509_certificate(der) {
                result.extend(extract_x509_fields(&cert));
            }
        }
    }

    Ok(result)
}

/// Full chain verification against the system trust store.
async fn validate_chain(host: &str, port: u16, timeout: Duration) -> bool {
    handshake(host, port, timeout, false).await.is_ok()
}

/// `SHA256:` + colon-separated uppercase hex of the DER bytes.
fn fingerprint_sha256(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let hex = hex::encode_upper(digest);
    let pairs: Vec<&str> = hex
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect();
    format!("SHA256:{}", pairs.join(":"))
}

fn first_attr<'a>(
    mut iter: impl Iterator<Item = &'a x509_parser::x509::AttributeTypeAndValue<'a>>,
) -> Option<String> {
    iter.next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

fn extract_x509_fields(cert: &X509Certificate<'_>) -> Map<String, Value> {
    let mut result = Map::new();

    put_opt(
        &mut result,
        "ssl_subject_cn",
        first_attr(cert.subject().iter_common_name()),
    );
    put_opt(
        &mut result,
        "ssl_issuer",
        first_attr(cert.issuer().iter_organization()),
    );
    put_opt(
        &mut result,
        "ssl_issuer_cn",
        first_attr(cert.issuer().iter_common_name()),
    );

    result.insert(
        "ssl_expires".to_string(),
        cert.validity().not_after.timestamp().into(),
    );
    result.insert(
        "ssl_not_before".to_string(),
        cert.validity().not_before.timestamp().into(),
    );

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        let names: Vec<Value> = san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(Value::String((*dns).to_string())),
                _ => None,
            })
            .collect();
        if !names.is_empty() {
            result.insert("ssl_san".to_string(), Value::Array(names));
        }
    }

    result.insert(
        "ssl_serial".to_string(),
        cert.tbs_certificate
            .serial
            .to_str_radix(16)
            .to_uppercase()
            .into(),
    );
    result.insert(
        "ssl_version".to_string(),
        i64::from(cert.version().0).into(),
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overlay_relays_skipped() {
        let relay = Relay::parse("ws://abcdef.onion").unwrap();
        let probe = execute(&relay, Duration::from_millis(100)).await;
        assert!(!probe.succeeded());
        assert!(
            probe
                .logs
                .reason
                .as_deref()
                .unwrap()
                .contains("requires clearnet")
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_with_reason() {
        let relay = Relay::parse("wss://192.0.32.10:9").unwrap();
        let probe = execute(&relay, Duration::from_millis(300)).await;
        assert!(!probe.succeeded());
        assert!(probe.logs.reason.is_some());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_sha256(b"test certificate bytes");
        assert!(fp.starts_with("SHA256:"));
        // 32 bytes -> 32 colon-separated pairs
        assert_eq!(fp.trim_start_matches("SHA256:").split(':').count(), 32);
        assert!(
            fp.trim_start_matches("SHA256:")
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == ':')
        );
    }
}
