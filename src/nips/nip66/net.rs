//! NIP-66 network check: ASN and organization lookup from the GeoLite2
//! ASN database. IPv4 data takes priority; IPv6 fills the gaps.
//! Clearnet relays only.

use std::net::IpAddr;
use std::sync::Arc;

use maxminddb::geoip2;
use serde_json::{Map, Value};

use crate::models::relay::{Network, Relay};
use crate::nips::nip66::geo::GeoReader;
use crate::nips::nip66::resolve_host;
use crate::nips::{Probe, ProbeLogs};

pub async fn execute(relay: &Relay, reader: Arc<GeoReader>) -> Probe {
    tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "net_testing");

    if relay.network != Network::Clearnet {
        return Probe {
            data: Value::Object(Map::new()),
            logs: ProbeLogs::fail(format!("requires clearnet, got {}", relay.network)),
        };
    }

    let resolved = resolve_host(&relay.host).await;
    if !resolved.has_ip() {
        tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "net_no_ip");
        return Probe {
            data: Value::Object(Map::new()),
            logs: ProbeLogs::fail("could not resolve hostname to IP"),
        };
    }

    let data = tokio::task::spawn_blocking(move || {
        lookup_asn(
            &reader,
            resolved.ipv4.map(IpAddr::V4),
            resolved.ipv6.map(IpAddr::V6),
        )
    })
    .await
    .unwrap_or_default();

    if data.is_empty() {
        tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "net_no_data");
        return Probe {
            data: Value::Object(data),
            logs: ProbeLogs::fail("no ASN data found for IP"),
        };
    }

    tracing::debug!(
        target: "bigbrotr::nips::nip66",
        relay = %relay.url,
        asn = ?data.get("net_asn"),
        "net_completed"
    );
    Probe {
        data: Value::Object(data),
        logs: ProbeLogs::ok(),
    }
}

fn lookup_asn(
    reader: &GeoReader,
    ipv4: Option<IpAddr>,
    ipv6: Option<IpAddr>,
) -> Map<String, Value> {
    let mut result = Map::new();

    if let Some(ip) = ipv4 {
        result.insert("net_ip".to_string(), ip.to_string().into());
        match reader.lookup_prefix::<geoip2::Asn>(ip) {
            Ok((asn, prefix_len)) => {
                if let Some(number) = asn.autonomous_system_number {
                    result.insert("net_asn".to_string(), i64::from(number).into());
                }
                if let Some(org) = asn.autonomous_system_organization {
                    result.insert("net_asn_org".to_string(), org.into());
                }
                result.insert("net_network".to_string(), network_cidr(ip, prefix_len).into());
            }
            Err(e) => {
                tracing::debug!(target: "bigbrotr::nips::nip66", ip = %ip, error = %e, "net_asn_ipv4_lookup_error");
            }
        }
    }

    if let Some(ip) = ipv6 {
        result.insert("net_ipv6".to_string(), ip.to_string().into());
        match reader.lookup_prefix::<geoip2::Asn>(ip) {
            Ok((asn, prefix_len)) => {
                result.insert(
                    "net_network_v6".to_string(),
                    network_cidr(ip, prefix_len).into(),
                );
                if !result.contains_key("net_asn") {
                    if let Some(number) = asn.autonomous_system_number {
                        result.insert("net_asn".to_string(), i64::from(number).into());
                    }
                    if let Some(org) = asn.autonomous_system_organization {
                        result.insert("net_asn_org".to_string(), org.into());
                    }
                }
            }
            Err(e) => {
                tracing::debug!(target: "bigbrotr::nips::nip66", ip = %ip, error = %e, "net_asn_ipv6_lookup_error");
            }
        }
    }

    result
}

/// Canonical CIDR for the prefix the database matched: masked network
/// address plus prefix length.
fn network_cidr(ip: IpAddr, prefix_len: usize) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - prefix_len.min(32))
            };
            let network = std::net::Ipv4Addr::from(bits & mask);
            format!("{network}/{}", prefix_len.min(32))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - prefix_len.min(128))
            };
            let network = std::net::Ipv6Addr::from(bits & mask);
            format!("{network}/{}", prefix_len.min(128))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_network_cidr_v4() {
        let ip = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(network_cidr(ip, 24), "93.184.216.0/24");
        assert_eq!(network_cidr(ip, 16), "93.184.0.0/16");
        assert_eq!(network_cidr(ip, 0), "0.0.0.0/0");
        assert_eq!(network_cidr(ip, 32), "93.184.216.34/32");
    }

    #[test]
    fn test_network_cidr_v6() {
        let ip = IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0, 0, 0, 0, 0x6810, 0x85e5));
        assert_eq!(network_cidr(ip, 32), "2606:4700::/32");
        assert_eq!(network_cidr(ip, 128), "2606:4700::6810:85e5/128");
    }
}
