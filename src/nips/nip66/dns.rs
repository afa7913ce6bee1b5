//! NIP-66 DNS check: A, AAAA, CNAME, NS and reverse PTR records for a
//! relay hostname. Clearnet relays only.
//!
//! Individual record lookups fail independently so one missing type
//! does not prevent the others from being collected. NS records are
//! resolved against the registered domain (public-suffix aware), and
//! reverse DNS uses the first resolved IPv4 address.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, RecordType};
use serde_json::{Map, Value};

use crate::models::relay::{Network, Relay};
use crate::nips::{Probe, ProbeLogs};

pub async fn execute(relay: &Relay, timeout: Duration) -> Probe {
    tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "dns_testing");

    if relay.network != Network::Clearnet {
        return Probe {
            data: Value::Object(Map::new()),
            logs: ProbeLogs::fail(format!("requires clearnet, got {}", relay.network)),
        };
    }

    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);

    let data = resolve_all(&resolver, &relay.host).await;
    if data.is_empty() {
        tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "dns_no_data");
        return Probe {
            data: Value::Object(data),
            logs: ProbeLogs::fail("no DNS records found"),
        };
    }

    tracing::debug!(
        target: "bigbrotr::nips::nip66",
        relay = %relay.url,
        ips = ?data.get("dns_ips"),
        "dns_completed"
    );
    Probe {
        data: Value::Object(data),
        logs: ProbeLogs::ok(),
    }
}

async fn resolve_all(resolver: &TokioAsyncResolver, host: &str) -> Map<String, Value> {
    let mut result = Map::new();

    // A records (IPv4) carry the TTL for the whole answer
    if let Ok(lookup) = resolver.ipv4_lookup(host).await {
        let ips: Vec<Value> = lookup
            .iter()
            .map(|a| Value::String(a.0.to_string()))
            .collect();
        if !ips.is_empty() {
            result.insert("dns_ips".to_string(), Value::Array(ips));
            if let Some(record) = lookup.as_lookup().records().first() {
                result.insert("dns_ttl".to_string(), i64::from(record.ttl()).into());
            }
        }
    }

    // AAAA records (IPv6)
    if let Ok(lookup) = resolver.ipv6_lookup(host).await {
        let ips: Vec<Value> = lookup
            .iter()
            .map(|aaaa| Value::String(aaaa.0.to_string()))
            .collect();
        if !ips.is_empty() {
            result.insert("dns_ips_v6".to_string(), Value::Array(ips));
        }
    }

    // CNAME
    if let Ok(lookup) = resolver.lookup(host, RecordType::CNAME).await {
        for rdata in lookup.iter() {
            if let RData::CNAME(target) = rdata {
                result.insert(
                    "dns_cname".to_string(),
                    target.0.to_utf8().trim_end_matches('.').to_string().into(),
                );
                break;
            }
        }
    }

    // NS records against the registered domain
    if let Some(domain) = psl::domain_str(host) {
        if let Ok(lookup) = resolver.lookup(domain, RecordType::NS).await {
            let ns: Vec<Value> = lookup
                .iter()
                .filter_map(|rdata| match rdata {
                    RData::NS(name) => Some(Value::String(
                        name.0.to_utf8().trim_end_matches('.').to_string(),
                    )),
                    _ => None,
                })
                .collect();
            if !ns.is_empty() {
                result.insert("dns_ns".to_string(), Value::Array(ns));
            }
        }
    }

    // Reverse DNS (PTR) via the first resolved IPv4
    let first_v4 = result
        .get("dns_ips")
        .and_then(Value::as_array)
        .and_then(|ips| ips.first())
        .and_then(Value::as_str)
        .and_then(|ip| ip.parse::<IpAddr>().ok());
    if let Some(ip) = first_v4 {
        if let Ok(lookup) = resolver.reverse_lookup(ip).await {
            if let Some(ptr) = lookup.iter().next() {
                result.insert(
                    "dns_reverse".to_string(),
                    ptr.0.to_utf8().trim_end_matches('.').to_string().into(),
                );
            }
        }
    }

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

    #[test]
    fn test_registered_domain_extraction() {
        assert_eq!(psl::domain_str("relay.damus.io"), Some("damus.io"));
        assert_eq!(psl::domain_str("a.b.example.co.uk"), Some("example.co.uk"));
    }

    #[tokio::test]
    async fn test_nonexistent_host_fails_with_reason() {
        let relay = Relay::parse("wss://definitely-not-a-real-host.invalid").unwrap();
        let probe = execute(&relay, Duration::from_millis(500)).await;
        assert!(!probe.succeeded());
        assert_eq!(probe.logs.reason.as_deref(), Some("no DNS records found"));
    }
}
