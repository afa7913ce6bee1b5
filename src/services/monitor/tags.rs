//! NIP-66 event construction: kind 30166 relay discovery, kind 10166
//! monitor announcement, and the kind 0 monitor profile.
//!
//! Tag values are strings per NIP-66. Boolean requirements use the `!`
//! prefix for negation (`!auth`, `!payment`); the relay type `T` is
//! derived from the payment requirement.

use nostr_sdk::prelude::*;
use serde_json::Value;

use crate::config::{MetadataFlags, ProfileConfig};
use crate::error::Result;
use crate::models::relay::Relay;
use crate::models::{Metadata, MetadataType};
use crate::services::monitor::checks::CheckResult;

fn tag(name: &str, value: impl Into<String>) -> Tag {
    Tag::custom(TagKind::custom(name.to_string()), [value.into()])
}

fn data_str<'a>(data: Option<&'a Value>, key: &str) -> Option<&'a str> {
    data?.get(key)?.as_str()
}

fn data_i64(data: Option<&Value>, key: &str) -> Option<i64> {
    data?.get(key)?.as_i64()
}

fn data_f64(data: Option<&Value>, key: &str) -> Option<f64> {
    data?.get(key)?.as_f64()
}

fn data_bool(data: Option<&Value>, key: &str) -> Option<bool> {
    data?.get(key)?.as_bool()
}

/// Kind 0 profile metadata event per NIP-01.
pub fn build_profile_event(profile: &ProfileConfig) -> EventBuilder {
    let mut metadata = nostr_sdk::Metadata::new();
    if let Some(name) = &profile.name {
        metadata = metadata.name(name).display_name(name);
    }
    if let Some(about) = &profile.about {
        metadata = metadata.about(about);
    }
    if let Some(picture) = &profile.picture {
        if let Ok(url) = Url::parse(picture) {
            metadata = metadata.picture(url);
        }
    }
    if let Some(banner) = &profile.banner {
        if let Ok(url) = Url::parse(banner) {
            metadata = metadata.banner(url);
        }
    }
    if let Some(nip05) = &profile.nip05 {
        metadata = metadata.nip05(nip05);
    }
    if let Some(website) = &profile.website {
        if let Ok(url) = Url::parse(website) {
            metadata = metadata.website(url);
        }
    }
    if let Some(lud16) = &profile.lud16 {
        metadata = metadata.lud16(lud16);
    }
    EventBuilder::metadata(&metadata)
}

/// Kind 10166 monitor announcement per NIP-66: the check frequency,
/// per-check timeouts, and one `c` tag per enabled check.
pub fn build_monitor_announcement(
    interval_s: u64,
    timeout_ms: u64,
    include: &MetadataFlags,
) -> EventBuilder {
    let timeout_ms = timeout_ms.to_string();
    let mut tags = vec![tag("frequency", interval_s.to_string())];

    let timeout_tag = |phase: &str| {
        Tag::custom(
            TagKind::custom("timeout".to_string()),
            [phase.to_string(), timeout_ms.clone()],
        )
    };

    if include.nip66_rtt {
        tags.push(timeout_tag("open"));
        tags.push(timeout_tag("read"));
        tags.push(timeout_tag("write"));
    }
    if include.nip11_info {
        tags.push(timeout_tag("nip11"));
    }
    if include.nip66_ssl {
        tags.push(timeout_tag("ssl"));
    }
    if include.nip66_dns {
        tags.push(timeout_tag("dns"));
    }
    if include.nip66_http {
        tags.push(timeout_tag("http"));
    }

    if include.nip66_rtt {
        tags.push(tag("c", "open"));
        tags.push(tag("c", "read"));
        tags.push(tag("c", "write"));
    }
    if include.nip11_info {
        tags.push(tag("c", "nip11"));
    }
    if include.nip66_ssl {
        tags.push(tag("c", "ssl"));
    }
    if include.nip66_geo {
        tags.push(tag("c", "geo"));
    }
    if include.nip66_net {
        tags.push(tag("c", "net"));
    }
    if include.nip66_dns {
        tags.push(tag("c", "dns"));
    }
    if include.nip66_http {
        tags.push(tag("c", "http"));
    }

    EventBuilder::new(Kind::from(10_166u16), "").tags(tags)
}

/// Kind 30166 relay discovery per NIP-66: identifier is the relay URL,
/// content is the canonical NIP-11 document, tags carry whatever checks
/// produced data.
pub fn build_relay_discovery(
    relay: &Relay,
    result: &CheckResult,
    include: &MetadataFlags,
) -> Result<EventBuilder> {
    let mut tags = vec![Tag::identifier(relay.url.clone()), tag("n", relay.network.as_str())];

    let mut content = String::new();
    let nip11 = result.nip11.as_ref().filter(|info| info.succeeded());
    if include.nip11_info {
        if let Some(info) = nip11 {
            let metadata = Metadata::new(MetadataType::Nip11Info, info.data().clone())?;
            content = metadata.canonical_json().to_string();
        }
    }

    if include.nip66_rtt {
        let rtt = result.rtt.as_ref().map(|probe| &probe.data);
        if let Some(ms) = data_i64(rtt, "rtt_open") {
            tags.push(tag("rtt-open", ms.to_string()));
        }
        if let Some(ms) = data_i64(rtt, "rtt_read") {
            tags.push(tag("rtt-read", ms.to_string()));
        }
        if let Some(ms) = data_i64(rtt, "rtt_write") {
            tags.push(tag("rtt-write", ms.to_string()));
        }
    }

    if include.nip66_ssl {
        let ssl = result.ssl.as_ref().map(|probe| &probe.data);
        if let Some(valid) = data_bool(ssl, "ssl_valid") {
            tags.push(tag("ssl", valid.to_string()));
        }
        if let Some(expires) = data_i64(ssl, "ssl_expires") {
            tags.push(tag("ssl-expires", expires.to_string()));
        }
        if let Some(issuer) = data_str(ssl, "ssl_issuer") {
            tags.push(tag("ssl-issuer", issuer));
        }
    }

    if include.nip66_net {
        let net = result.net.as_ref().map(|probe| &probe.data);
        if let Some(ip) = data_str(net, "net_ip") {
            tags.push(tag("net-ip", ip));
        }
        if let Some(ipv6) = data_str(net, "net_ipv6") {
            tags.push(tag("net-ipv6", ipv6));
        }
        if let Some(asn) = data_i64(net, "net_asn") {
            tags.push(tag("net-asn", asn.to_string()));
        }
        if let Some(org) = data_str(net, "net_asn_org") {
            tags.push(tag("net-asn-org", org));
        }
    }

    if include.nip66_geo {
        let geo = result.geo.as_ref().map(|probe| &probe.data);
        if let Some(hash) = data_str(geo, "geo_hash") {
            tags.push(tag("g", hash));
        }
        if let Some(country) = data_str(geo, "geo_country") {
            tags.push(tag("geo-country", country));
        }
        if let Some(city) = data_str(geo, "geo_city") {
            tags.push(tag("geo-city", city));
        }
        if let Some(lat) = data_f64(geo, "geo_lat") {
            tags.push(tag("geo-lat", lat.to_string()));
        }
        if let Some(lon) = data_f64(geo, "geo_lon") {
            tags.push(tag("geo-lon", lon.to_string()));
        }
        if let Some(tz) = data_str(geo, "geo_tz") {
            tags.push(tag("geo-tz", tz));
        }
    }

    if include.nip11_info {
        if let Some(info) = nip11 {
            for nip in info.supported_nips() {
                tags.push(tag("N", nip.to_string()));
            }
            for topic in info.topics() {
                tags.push(tag("t", topic));
            }
            for language in info.language_tags() {
                tags.push(tag("l", language));
            }
            if let Some(auth) = info.auth_required() {
                tags.push(tag("R", if auth { "auth" } else { "!auth" }));
            }
            if let Some(payment) = info.payment_required() {
                tags.push(tag("R", if payment { "payment" } else { "!payment" }));
                tags.push(tag("T", if payment { "paid" } else { "public" }));
            }
        }
    }

    Ok(EventBuilder::new(Kind::from(30_166u16), content).tags(tags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nips::nip11::Nip11Info;
    use crate::nips::nip66::{RttLogs, RttProbe};
    use crate::nips::{Probe, ProbeLogs};
    use serde_json::json;

    fn tag_values(event: &nostr_sdk::Event, name: &str) -> Vec<Vec<String>> {
        event
            .tags
            .iter()
            .filter(|tag| tag.as_slice().first().map(String::as_str) == Some(name))
            .map(|tag| tag.as_slice().to_vec())
            .collect()
    }

    fn sample_result() -> CheckResult {
        CheckResult {
            generated_at: 1_700_000_000,
            nip11: Some(Nip11Info {
                probe: Probe {
                    data: json!({
                        "name": "Test Relay",
                        "supported_nips": [1, 11, 66],
                        "tags": ["sfw-only"],
                        "language_tags": ["en"],
                        "limitation": {"auth_required": false, "payment_required": true}
                    }),
                    logs: ProbeLogs::ok(),
                },
            }),
            rtt: Some(RttProbe {
                data: json!({"rtt_open": 42, "rtt_read": 120}),
                logs: RttLogs {
                    open_success: true,
                    open_reason: None,
                    read_success: Some(true),
                    read_reason: None,
                    write_success: Some(false),
                    write_reason: Some("restricted".to_string()),
                },
            }),
            ssl: Some(Probe {
                data: json!({"ssl_valid": true, "ssl_expires": 1_800_000_000, "ssl_issuer": "Let's Encrypt"}),
                logs: ProbeLogs::ok(),
            }),
            geo: Some(Probe {
                data: json!({"geo_hash": "u4pruydqqvj", "geo_country": "DK", "geo_lat": 57.648, "geo_lon": 10.407, "geo_tz": "Europe/Copenhagen"}),
                logs: ProbeLogs::ok(),
            }),
            net: Some(Probe {
                data: json!({"net_ip": "1.2.3.4", "net_asn": 13335, "net_asn_org": "CLOUDFLARENET"}),
                logs: ProbeLogs::ok(),
            }),
            dns: None,
            http: None,
        }
    }

    #[test]
    fn test_discovery_event_tags() {
        let relay = Relay::parse("wss://relay.example.com").unwrap();
        let keys = Keys::generate();
        let builder =
            build_relay_discovery(&relay, &sample_result(), &MetadataFlags::default()).unwrap();
        let event = builder.sign_with_keys(&keys).unwrap();

        assert_eq!(event.kind.as_u16(), 30_166);
        assert_eq!(
            tag_values(&event, "d"),
            vec![vec!["d".to_string(), "wss://relay.example.com".to_string()]]
        );
        assert_eq!(tag_values(&event, "rtt-open")[0][1], "42");
        assert_eq!(tag_values(&event, "rtt-read")[0][1], "120");
        assert!(tag_values(&event, "rtt-write").is_empty());
        assert_eq!(tag_values(&event, "ssl")[0][1], "true");
        assert_eq!(tag_values(&event, "ssl-issuer")[0][1], "Let's Encrypt");
        assert_eq!(tag_values(&event, "g")[0][1], "u4pruydqqvj");
        assert_eq!(tag_values(&event, "net-asn")[0][1], "13335");
        assert_eq!(tag_values(&event, "N").len(), 3);
        assert_eq!(tag_values(&event, "t")[0][1], "sfw-only");
        assert_eq!(tag_values(&event, "l")[0][1], "en");

        let requirements: Vec<String> = tag_values(&event, "R")
            .into_iter()
            .map(|tag| tag[1].clone())
            .collect();
        assert!(requirements.contains(&"!auth".to_string()));
        assert!(requirements.contains(&"payment".to_string()));
        assert_eq!(tag_values(&event, "T")[0][1], "paid");

        // content carries the canonical NIP-11 document
        let content: serde_json::Value = serde_json::from_str(&event.content).unwrap();
        assert_eq!(content["name"], "Test Relay");
    }

    #[test]
    fn test_discovery_event_respects_include_flags() {
        let relay = Relay::parse("wss://relay.example.com").unwrap();
        let keys = Keys::generate();
        let include = MetadataFlags {
            nip66_rtt: false,
            nip66_geo: false,
            ..MetadataFlags::default()
        };
        let event = build_relay_discovery(&relay, &sample_result(), &include)
            .unwrap()
            .sign_with_keys(&keys)
            .unwrap();
        assert!(tag_values(&event, "rtt-open").is_empty());
        assert!(tag_values(&event, "g").is_empty());
        assert!(!tag_values(&event, "ssl").is_empty());
    }

    #[test]
    fn test_announcement_event() {
        let keys = Keys::generate();
        let include = MetadataFlags {
            nip66_geo: false,
            ..MetadataFlags::default()
        };
        let event = build_monitor_announcement(3600, 10_000, &include)
            .sign_with_keys(&keys)
            .unwrap();

        assert_eq!(event.kind.as_u16(), 10_166);
        assert_eq!(tag_values(&event, "frequency")[0][1], "3600");
        let checks: Vec<String> = tag_values(&event, "c")
            .into_iter()
            .map(|tag| tag[1].clone())
            .collect();
        assert!(checks.contains(&"open".to_string()));
        assert!(checks.contains(&"nip11".to_string()));
        assert!(!checks.contains(&"geo".to_string()));
        let timeouts = tag_values(&event, "timeout");
        assert!(timeouts.iter().all(|tag| tag[2] == "10000"));
    }

    #[test]
    fn test_profile_event() {
        let keys = Keys::generate();
        let profile = ProfileConfig {
            enabled: true,
            name: Some("bigbrotr-monitor".to_string()),
            about: Some("Nostr relay monitor".to_string()),
            ..ProfileConfig::default()
        };
        let event = build_profile_event(&profile).sign_with_keys(&keys).unwrap();
        assert_eq!(event.kind.as_u16(), 0);
        let content: serde_json::Value = serde_json::from_str(&event.content).unwrap();
        assert_eq!(content["name"], "bigbrotr-monitor");
        assert_eq!(content["about"], "Nostr relay monitor");
    }
}
