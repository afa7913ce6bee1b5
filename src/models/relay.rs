//! Validated Nostr relay URL with network type detection.
//!
//! Parses, normalizes, and validates WebSocket relay URLs (`ws://` or
//! `wss://`), detecting the network type (clearnet, Tor, I2P, Lokinet)
//! from the hostname and enforcing the correct scheme per network.
//! Local and private addresses are rejected.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Host, Url};

/// Network a relay is reachable on, derived purely from its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Clearnet,
    Tor,
    I2p,
    Loki,
}

impl Network {
    pub const ALL: [Network; 4] = [Network::Clearnet, Network::Tor, Network::I2p, Network::Loki];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Clearnet => "clearnet",
            Network::Tor => "tor",
            Network::I2p => "i2p",
            Network::Loki => "loki",
        }
    }

    /// Overlay networks are reached through a SOCKS5 proxy and carry
    /// their own encryption, so relays on them use plain `ws://`.
    pub fn is_overlay(&self) -> bool {
        !matches!(self, Network::Clearnet)
    }

    pub fn from_str_opt(s: &str) -> Option<Network> {
        match s {
            "clearnet" => Some(Network::Clearnet),
            "tor" => Some(Network::Tor),
            "i2p" => Some(Network::I2p),
            "loki" => Some(Network::Loki),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayUrlError {
    #[error("relay URL contains null bytes")]
    NullBytes,

    #[error("malformed URL: {0}")]
    Malformed(String),

    #[error("invalid scheme: must be ws or wss")]
    InvalidScheme,

    #[error("relay URL must not contain a query string")]
    QueryNotAllowed,

    #[error("relay URL must not contain a fragment")]
    FragmentNotAllowed,

    #[error("relay URL has no host")]
    MissingHost,

    #[error("local addresses not allowed")]
    LocalAddress,

    #[error("invalid host: '{0}'")]
    InvalidHost(String),
}

/// Immutable representation of a Nostr relay.
///
/// Validates and normalizes a WebSocket URL on construction, detecting
/// the network type from the hostname. The scheme is enforced per
/// network:
///
/// * **clearnet**: `wss://` (TLS required on the public internet)
/// * **tor / i2p / loki**: `ws://` (encryption handled by the overlay)
///
/// The fields double as the database insert parameters; everything is
/// computed once in [`Relay::parse`] so an invalid relay never exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Relay {
    /// Fully normalized URL including scheme.
    pub url: String,
    /// Detected network type.
    pub network: Network,
    /// URL scheme (`ws` or `wss`), forced per network.
    pub scheme: &'static str,
    /// Hostname or IP address (brackets stripped for IPv6).
    pub host: String,
    /// Explicit port, or `None` when using the scheme default.
    pub port: Option<u16>,
    /// Normalized path component, or `None`.
    pub path: Option<String>,
    /// Unix timestamp when the relay was first discovered.
    pub discovered_at: i64,
}

impl Relay {
    /// Parse and validate a raw relay URL, stamping `discovered_at` with
    /// the current time.
    pub fn parse(raw: &str) -> Result<Self, RelayUrlError> {
        Self::with_discovered_at(raw, chrono::Utc::now().timestamp())
    }

    /// Parse and validate a raw relay URL with an explicit discovery
    /// timestamp (used when reconstructing rows from the database).
    pub fn with_discovered_at(raw: &str, discovered_at: i64) -> Result<Self, RelayUrlError> {
        if raw.contains('\0') {
            return Err(RelayUrlError::NullBytes);
        }

        let parsed =
            Url::parse(raw.trim()).map_err(|e| RelayUrlError::Malformed(e.to_string()))?;

        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RelayUrlError::InvalidScheme);
        }
        if parsed.query().is_some() {
            return Err(RelayUrlError::QueryNotAllowed);
        }
        if parsed.fragment().is_some() {
            return Err(RelayUrlError::FragmentNotAllowed);
        }

        let host = parsed.host().ok_or(RelayUrlError::MissingHost)?;
        let network = detect_network(&host)?;

        // Clearnet requires TLS; overlay networks handle encryption themselves
        let scheme = if network == Network::Clearnet {
            "wss"
        } else {
            "ws"
        };

        // Collapse duplicate slashes and strip the trailing slash
        let mut path = parsed.path().to_string();
        while path.contains("//") {
            path = path.replace("//", "/");
        }
        let path = {
            let trimmed = path.trim_end_matches('/');
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };

        // `Url::port()` already elides the raw scheme's default; drop
        // the forced scheme's default too.
        let default_port = if scheme == "wss" { 443 } else { 80 };
        let port = parsed.port().filter(|p| *p != default_port);

        let (host_bare, host_formatted) = match host {
            Host::Domain(d) => (d.to_string(), d.to_string()),
            Host::Ipv4(ip) => (ip.to_string(), ip.to_string()),
            Host::Ipv6(ip) => (ip.to_string(), format!("[{ip}]")),
        };

        let mut url = format!("{scheme}://{host_formatted}");
        if let Some(p) = port {
            url.push_str(&format!(":{p}"));
        }
        if let Some(p) = &path {
            url.push_str(p);
        }

        Ok(Relay {
            url,
            network,
            scheme,
            host: host_bare,
            port,
            path,
            discovered_at,
        })
    }

    /// The relay's NIP-11 endpoint: same authority over HTTP(S).
    pub fn http_url(&self) -> String {
        let protocol = if self.scheme == "wss" { "https" } else { "http" };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let mut url = format!("{protocol}://{host}");
        if let Some(p) = self.port {
            url.push_str(&format!(":{p}"));
        }
        if let Some(p) = &self.path {
            url.push_str(p);
        }
        url
    }
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

fn detect_network(host: &Host<&str>) -> Result<Network, RelayUrlError> {
    match host {
        Host::Domain(domain) => {
            let domain = domain.to_ascii_lowercase();
            if domain.ends_with(".onion") {
                return Ok(Network::Tor);
            }
            if domain.ends_with(".i2p") {
                return Ok(Network::I2p);
            }
            if domain.ends_with(".loki") {
                return Ok(Network::Loki);
            }
            if domain == "localhost" || domain == "localhost.localdomain" {
                return Err(RelayUrlError::LocalAddress);
            }
            if !domain.contains('.') {
                return Err(RelayUrlError::InvalidHost(domain));
            }
            let valid = domain
                .split('.')
                .all(|label| !label.is_empty() && !label.starts_with('-') && !label.ends_with('-'));
            if valid {
                Ok(Network::Clearnet)
            } else {
                Err(RelayUrlError::InvalidHost(domain))
            }
        }
        Host::Ipv4(ip) => {
            if is_local_ipv4(*ip) {
                Err(RelayUrlError::LocalAddress)
            } else {
                Ok(Network::Clearnet)
            }
        }
        Host::Ipv6(ip) => {
            if is_local_ipv6(*ip) {
                Err(RelayUrlError::LocalAddress)
            } else {
                Ok(Network::Clearnet)
            }
        }
    }
}

/// IANA IPv4 special-purpose ranges that never identify a public relay.
/// https://www.iana.org/assignments/iana-ipv4-special-registry/
fn is_local_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, c, d] = ip.octets();
    match (a, b, c, d) {
        (0, ..) => true,                                // 0.0.0.0/8
        (10, ..) => true,                               // 10.0.0.0/8
        (100, 64..=127, ..) => true,                    // 100.64.0.0/10
        (127, ..) => true,                              // 127.0.0.0/8
        (169, 254, ..) => true,                         // 169.254.0.0/16
        (172, 16..=31, ..) => true,                     // 172.16.0.0/12
        (192, 0, 0, _) => true,                         // 192.0.0.0/24
        (192, 0, 2, _) => true,                         // 192.0.2.0/24
        (192, 88, 99, _) => true,                       // 192.88.99.0/24
        (192, 168, ..) => true,                         // 192.168.0.0/16
        (198, 18..=19, ..) => true,                     // 198.18.0.0/15
        (198, 51, 100, _) => true,                      // 198.51.100.0/24
        (203, 0, 113, _) => true,                       // 203.0.113.0/24
        (224..=239, ..) => true,                        // 224.0.0.0/4
        (240..=255, ..) => true,                        // 240.0.0.0/4 + broadcast
        _ => false,
    }
}

/// IANA IPv6 special-purpose ranges that never identify a public relay.
/// https://www.iana.org/assignments/iana-ipv6-special-registry/
fn is_local_ipv6(ip: Ipv6Addr) -> bool {
    let seg = ip.segments();
    // ::1/128 and ::/128
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    // ::ffff:0:0/96 (IPv4-mapped)
    if seg[..5] == [0, 0, 0, 0, 0] && seg[5] == 0xffff {
        return true;
    }
    // 64:ff9b::/96 (NAT64)
    if seg[0] == 0x0064 && seg[1] == 0xff9b && seg[2..6] == [0, 0, 0, 0] {
        return true;
    }
    // 100::/64 (discard-only)
    if seg[0] == 0x0100 && seg[1..4] == [0, 0, 0] {
        return true;
    }
    if seg[0] == 0x2001 {
        // 2001::/32 (Teredo), 2001:2::/48 (benchmarking),
        // 2001:db8::/32 (documentation), 2001:10::/28 (ORCHID)
        if seg[1] == 0x0000 {
            return true;
        }
        if seg[1] == 0x0002 && seg[2] == 0x0000 {
            return true;
        }
        if seg[1] == 0x0db8 {
            return true;
        }
        if (seg[1] & 0xfff0) == 0x0010 {
            return true;
        }
    }
    // fc00::/7 (unique local)
    if (seg[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // fe80::/10 (link local)
    if (seg[0] & 0xffc0) == 0xfe80 {
        return true;
    }
    // ff00::/8 (multicast)
    if (seg[0] & 0xff00) == 0xff00 {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    mod normalization_tests {
        use super::*;

        #[test]
        fn test_full_normalization() {
            let relay = Relay::parse(" WsS://Relay.Example.COM:443/foo//bar/ ").unwrap();
            assert_eq!(relay.url, "wss://relay.example.com/foo/bar");
            assert_eq!(relay.network, Network::Clearnet);
            assert_eq!(relay.scheme, "wss");
            assert_eq!(relay.port, None);
            assert_eq!(relay.path.as_deref(), Some("/foo/bar"));
        }

        #[test]
        fn test_parse_is_idempotent() {
            let inputs = [
                "wss://relay.example.com:8443/sub//path/",
                "ws://abcdefabcdef.onion/",
                "wss://192.0.32.10:7777",
            ];
            for input in inputs {
                let first = Relay::parse(input).unwrap();
                let second = Relay::parse(&first.url).unwrap();
                assert_eq!(first.url, second.url, "input: {input}");
                assert_eq!(first.network, second.network);
                assert_eq!(first.port, second.port);
                assert_eq!(first.path, second.path);
            }
        }

        #[test]
        fn test_default_port_elided() {
            let relay = Relay::parse("wss://relay.example.com:443").unwrap();
            assert_eq!(relay.url, "wss://relay.example.com");
            assert_eq!(relay.port, None);

            let relay = Relay::parse("wss://relay.example.com:8443").unwrap();
            assert_eq!(relay.url, "wss://relay.example.com:8443");
            assert_eq!(relay.port, Some(8443));
        }

        #[test]
        fn test_overlay_scheme_forced_to_ws() {
            let relay = Relay::parse("wss://abcd.onion/").unwrap();
            assert_eq!(relay.url, "ws://abcd.onion");
            assert_eq!(relay.scheme, "ws");
            assert_eq!(relay.network, Network::Tor);

            let relay = Relay::parse("wss://example.i2p").unwrap();
            assert_eq!(relay.network, Network::I2p);
            assert_eq!(relay.scheme, "ws");

            let relay = Relay::parse("ws://example.loki").unwrap();
            assert_eq!(relay.network, Network::Loki);
        }

        #[test]
        fn test_clearnet_scheme_forced_to_wss() {
            let relay = Relay::parse("ws://relay.example.com").unwrap();
            assert_eq!(relay.url, "wss://relay.example.com");
            assert_eq!(relay.scheme, "wss");
        }

        #[test]
        fn test_ipv6_host_rebracketed() {
            let relay = Relay::parse("wss://[2606:4700::6810:85e5]:8443").unwrap();
            assert_eq!(relay.url, "wss://[2606:4700::6810:85e5]:8443");
            assert_eq!(relay.host, "2606:4700::6810:85e5");
        }

        #[test]
        fn test_http_url() {
            let relay = Relay::parse("wss://relay.example.com:8443/nostr").unwrap();
            assert_eq!(relay.http_url(), "https://relay.example.com:8443/nostr");

            let relay = Relay::parse("ws://abcd.onion").unwrap();
            assert_eq!(relay.http_url(), "http://abcd.onion");
        }
    }

    mod rejection_tests {
        use super::*;

        #[test]
        fn test_private_ipv4_rejected() {
            for url in [
                "wss://10.0.0.1",
                "wss://127.0.0.1",
                "wss://192.168.1.5:8080",
                "wss://172.16.0.1",
                "wss://169.254.0.1",
                "wss://100.64.0.1",
                "wss://0.0.0.0",
                "wss://224.0.0.1",
                "wss://255.255.255.255",
            ] {
                assert_eq!(
                    Relay::parse(url).unwrap_err(),
                    RelayUrlError::LocalAddress,
                    "url: {url}"
                );
            }
        }

        #[test]
        fn test_private_ipv6_rejected() {
            for url in [
                "wss://[::1]",
                "wss://[fe80::1]",
                "wss://[fc00::1]",
                "wss://[2001:db8::1]",
                "wss://[ff02::1]",
            ] {
                assert_eq!(
                    Relay::parse(url).unwrap_err(),
                    RelayUrlError::LocalAddress,
                    "url: {url}"
                );
            }
        }

        #[test]
        fn test_public_addresses_accepted() {
            assert!(Relay::parse("wss://1.1.1.1").is_ok());
            assert!(Relay::parse("wss://[2606:4700::6810:85e5]").is_ok());
        }

        #[test]
        fn test_localhost_rejected() {
            assert_eq!(
                Relay::parse("ws://localhost:8080").unwrap_err(),
                RelayUrlError::LocalAddress
            );
            assert_eq!(
                Relay::parse("ws://localhost.localdomain").unwrap_err(),
                RelayUrlError::LocalAddress
            );
        }

        #[test]
        fn test_invalid_scheme_rejected() {
            assert_eq!(
                Relay::parse("https://relay.example.com").unwrap_err(),
                RelayUrlError::InvalidScheme
            );
        }

        #[test]
        fn test_query_and_fragment_rejected() {
            assert_eq!(
                Relay::parse("wss://relay.example.com/?limit=1").unwrap_err(),
                RelayUrlError::QueryNotAllowed
            );
            assert_eq!(
                Relay::parse("wss://relay.example.com/#top").unwrap_err(),
                RelayUrlError::FragmentNotAllowed
            );
        }

        #[test]
        fn test_null_bytes_rejected() {
            assert_eq!(
                Relay::parse("wss://relay.example.com\0").unwrap_err(),
                RelayUrlError::NullBytes
            );
        }

        #[test]
        fn test_invalid_hosts_rejected() {
            assert!(matches!(
                Relay::parse("wss://singlelabel").unwrap_err(),
                RelayUrlError::InvalidHost(_)
            ));
            assert!(matches!(
                Relay::parse("wss://bad-.example.com").unwrap_err(),
                RelayUrlError::InvalidHost(_)
            ));
            assert!(Relay::parse("not a url").is_err());
        }
    }
}
