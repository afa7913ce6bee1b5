//! Health-check pipeline for a single relay: NIP-11 first (the RTT
//! write test may need its proof-of-work floor), then RTT, then the
//! independent probes in parallel. Every probe is wrapped in a
//! per-type retry policy with exponential backoff and uniform jitter.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use ::rand::Rng;

use crate::config::{MonitorConfig, CheckRetryConfig};
use crate::models::relay::{Network, Relay};
use crate::nips::nip11::{Nip11Info, Nip11Options};
use crate::nips::nip66::geo::GeoReader;
use crate::nips::nip66::{RttProbe, dns, geo, http, net, rtt, ssl};
use crate::nips::Probe;
use crate::services::Shutdown;

/// Ephemeral kind used for the RTT write test (never retained).
const RTT_TEST_KIND: u16 = 20_000;

/// Result of one relay's full checks pipeline. `None` fields were
/// skipped (disabled or inapplicable) or failed completely.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    pub generated_at: i64,
    pub nip11: Option<Nip11Info>,
    pub rtt: Option<RttProbe>,
    pub ssl: Option<Probe>,
    pub geo: Option<Probe>,
    pub net: Option<Probe>,
    pub dns: Option<Probe>,
    pub http: Option<Probe>,
}

impl CheckResult {
    /// At least one check produced data.
    pub fn has_data(&self) -> bool {
        self.nip11.is_some()
            || self.rtt.is_some()
            || self.ssl.is_some()
            || self.geo.is_some()
            || self.net.is_some()
            || self.dns.is_some()
            || self.http.is_some()
    }
}

/// Open GeoLite2 readers, held for the duration of one cycle.
#[derive(Default, Clone)]
pub struct GeoReaders {
    pub city: Option<Arc<GeoReader>>,
    pub asn: Option<Arc<GeoReader>>,
}

impl GeoReaders {
    /// Open the configured databases. A reader that fails to open is
    /// logged and skipped; the affected checks are simply not run this
    /// cycle.
    pub async fn open(city_path: Option<&Path>, asn_path: Option<&Path>) -> Self {
        let mut readers = Self::default();
        if let Some(path) = city_path {
            match geo::open_reader(path).await {
                Ok(reader) => readers.city = Some(reader),
                Err(e) => {
                    tracing::warn!(
                        target: "bigbrotr::services::monitor",
                        path = %path.display(),
                        error = %e,
                        "geo_reader_open_failed"
                    );
                }
            }
        }
        if let Some(path) = asn_path {
            match geo::open_reader(path).await {
                Ok(reader) => readers.asn = Some(reader),
                Err(e) => {
                    tracing::warn!(
                        target: "bigbrotr::services::monitor",
                        path = %path.display(),
                        error = %e,
                        "asn_reader_open_failed"
                    );
                }
            }
        }
        readers
    }

    pub fn close(&mut self) {
        self.city = None;
        self.asn = None;
    }
}

/// Run a check up to `1 + max_attempts` times, sleeping
/// `min(initial·2ⁿ, max) + U(0, jitter)` between tries. Returns the
/// last result even when it never succeeded; `None` only when shutdown
/// interrupted the backoff sleep.
pub async fn with_retry<T, F, Fut, S>(
    shutdown: &Shutdown,
    retry: &CheckRetryConfig,
    operation: &str,
    relay_url: &str,
    is_success: S,
    make: F,
) -> Option<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
    S: Fn(&T) -> bool,
{
    let mut last: Option<T> = None;
    for attempt in 0..=retry.max_attempts {
        let value = make().await;
        if is_success(&value) {
            return Some(value);
        }
        last = Some(value);

        if attempt < retry.max_attempts {
            let backoff = (retry.initial_delay_s * 2f64.powi(attempt as i32)).min(retry.max_delay_s);
            let jitter = if retry.jitter_s > 0.0 {
                ::rand::rng().random_range(0.0..retry.jitter_s)
            } else {
                0.0
            };
            tracing::debug!(
                target: "bigbrotr::services::monitor",
                operation,
                relay = relay_url,
                attempt = attempt + 1,
                delay_s = backoff + jitter,
                "check_retry"
            );
            if shutdown
                .wait_for(Duration::from_secs_f64(backoff + jitter))
                .await
            {
                return last;
            }
        }
    }

    if retry.max_attempts > 0 {
        tracing::debug!(
            target: "bigbrotr::services::monitor",
            operation,
            relay = relay_url,
            total_attempts = retry.max_attempts + 1,
            "check_exhausted"
        );
    }
    last
}

/// Perform all configured health checks on one relay. The caller holds
/// the network semaphore permit.
pub async fn check_relay(
    relay: &Relay,
    config: &MonitorConfig,
    keys: &Keys,
    readers: &GeoReaders,
    shutdown: &Shutdown,
) -> CheckResult {
    let network_config = config.networks.get(relay.network);
    let proxy = network_config.resolve_proxy();
    let proxy = proxy.as_deref();
    let timeout = network_config.timeout();
    let compute = &config.processing.compute;
    let retries = &config.processing.retries;
    let allow_insecure = config.processing.allow_insecure;
    let is_clearnet = relay.network == Network::Clearnet;

    let mut result = CheckResult {
        generated_at: chrono::Utc::now().timestamp(),
        ..CheckResult::default()
    };

    // NIP-11 first: the write test honors an advertised pow floor
    if compute.nip11_info {
        let options = Nip11Options {
            timeout,
            connect_timeout: timeout,
            max_size: config.processing.nip11_info_max_size,
            allow_insecure,
        };
        result.nip11 = with_retry(
            shutdown,
            &retries.nip11_info,
            "nip11_info",
            &relay.url,
            Nip11Info::succeeded,
            || Nip11Info::fetch(relay, proxy, options),
        )
        .await;
    }

    if compute.nip66_rtt {
        match build_rtt_test_event(relay, keys, result.nip11.as_ref()) {
            Ok(test_event) => {
                result.rtt = with_retry(
                    shutdown,
                    &retries.nip66_rtt,
                    "nip66_rtt",
                    &relay.url,
                    RttProbe::succeeded,
                    || rtt::execute(relay, keys, &test_event, proxy, timeout, allow_insecure),
                )
                .await;
            }
            Err(e) => {
                tracing::debug!(
                    target: "bigbrotr::services::monitor",
                    relay = %relay.url,
                    error = %e,
                    "rtt_event_build_failed"
                );
            }
        }
    }

    // Independent checks run concurrently
    let ssl_check = async {
        if compute.nip66_ssl && is_clearnet {
            with_retry(
                shutdown,
                &retries.nip66_ssl,
                "nip66_ssl",
                &relay.url,
                Probe::succeeded,
                || ssl::execute(relay, timeout),
            )
            .await
        } else {
            None
        }
    };
    let dns_check = async {
        if compute.nip66_dns && is_clearnet {
            with_retry(
                shutdown,
                &retries.nip66_dns,
                "nip66_dns",
                &relay.url,
                Probe::succeeded,
                || dns::execute(relay, timeout),
            )
            .await
        } else {
            None
        }
    };
    let geo_check = async {
        match (&readers.city, compute.nip66_geo && is_clearnet) {
            (Some(reader), true) => {
                let precision = config.geo.geohash_precision;
                with_retry(
                    shutdown,
                    &retries.nip66_geo,
                    "nip66_geo",
                    &relay.url,
                    Probe::succeeded,
                    || geo::execute(relay, reader.clone(), precision),
                )
                .await
            }
            _ => None,
        }
    };
    let net_check = async {
        match (&readers.asn, compute.nip66_net && is_clearnet) {
            (Some(reader), true) => {
                with_retry(
                    shutdown,
                    &retries.nip66_net,
                    "nip66_net",
                    &relay.url,
                    Probe::succeeded,
                    || net::execute(relay, reader.clone()),
                )
                .await
            }
            _ => None,
        }
    };
    let http_check = async {
        if compute.nip66_http {
            with_retry(
                shutdown,
                &retries.nip66_http,
                "nip66_http",
                &relay.url,
                Probe::succeeded,
                || http::execute(relay, proxy, timeout, allow_insecure),
            )
            .await
        } else {
            None
        }
    };

    let (ssl_result, dns_result, geo_result, net_result, http_result) =
        tokio::join!(ssl_check, dns_check, geo_check, net_check, http_check);
    result.ssl = ssl_result;
    result.dns = dns_result;
    result.geo = geo_result;
    result.net = net_result;
    result.http = http_result;

    if result.has_data() {
        tracing::debug!(target: "bigbrotr::services::monitor", url = %relay.url, "check_succeeded");
    } else {
        tracing::debug!(target: "bigbrotr::services::monitor", url = %relay.url, "check_failed");
    }
    result
}

/// The ephemeral write-test event, with proof of work applied when the
/// relay's info document advertises a minimum difficulty.
fn build_rtt_test_event(
    relay: &Relay,
    keys: &Keys,
    nip11: Option<&Nip11Info>,
) -> crate::error::Result<nostr_sdk::Event> {
    let mut builder = EventBuilder::new(Kind::from(RTT_TEST_KIND), "bigbrotr-rtt-test")
        .tags([Tag::identifier(relay.url.clone())]);

    if let Some(info) = nip11 {
        if info.succeeded() {
            if let Some(difficulty) = info.min_pow_difficulty() {
                if difficulty > 0 {
                    builder = builder.pow(difficulty);
                }
            }
        }
    }

    Ok(builder.sign_with_keys(keys)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_result_has_data() {
        let empty = CheckResult::default();
        assert!(!empty.has_data());

        let with_http = CheckResult {
            http: Some(Probe {
                data: json!({"http_server": "nginx"}),
                logs: crate::nips::ProbeLogs::ok(),
            }),
            ..CheckResult::default()
        };
        assert!(with_http.has_data());
    }

    #[tokio::test]
    async fn test_with_retry_returns_first_success() {
        let shutdown = Shutdown::new();
        let retry = CheckRetryConfig {
            max_attempts: 3,
            initial_delay_s: 0.01,
            max_delay_s: 0.01,
            jitter_s: 0.0,
        };
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = with_retry(
            &shutdown,
            &retry,
            "test",
            "wss://relay.example.com",
            |v: &u32| *v >= 2,
            || async {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                calls.load(std::sync::atomic::Ordering::SeqCst)
            },
        )
        .await;
        assert_eq!(result, Some(2));
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_and_returns_last() {
        let shutdown = Shutdown::new();
        let retry = CheckRetryConfig {
            max_attempts: 2,
            initial_delay_s: 0.001,
            max_delay_s: 0.001,
            jitter_s: 0.001,
        };
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = with_retry(
            &shutdown,
            &retry,
            "test",
            "wss://relay.example.com",
            |_: &u32| false,
            || async {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                calls.load(std::sync::atomic::Ordering::SeqCst)
            },
        )
        .await;
        // 1 initial try + 2 retries, last value returned
        assert_eq!(result, Some(3));
    }

    #[tokio::test]
    async fn test_with_retry_zero_attempts_runs_once() {
        let shutdown = Shutdown::new();
        let retry = CheckRetryConfig::default();
        assert_eq!(retry.max_attempts, 0);
        let result = with_retry(
            &shutdown,
            &retry,
            "test",
            "wss://relay.example.com",
            |_: &u32| false,
            || async { 7u32 },
        )
        .await;
        assert_eq!(result, Some(7));
    }

    #[test]
    fn test_rtt_test_event_applies_pow_from_nip11() {
        let relay = Relay::parse("wss://relay.example.com").unwrap();
        let keys = Keys::generate();

        let info = Nip11Info {
            probe: Probe {
                data: json!({"limitation": {"min_pow_difficulty": 8}}),
                logs: crate::nips::ProbeLogs::ok(),
            },
        };
        let event = build_rtt_test_event(&relay, &keys, Some(&info)).unwrap();
        assert_eq!(event.kind.as_u16(), RTT_TEST_KIND);
        // nip13: leading zero bits of the id must satisfy the target
        let nonce_tag = event
            .tags
            .iter()
            .any(|tag| tag.as_slice().first().map(String::as_str) == Some("nonce"));
        assert!(nonce_tag, "pow event carries a nonce tag");

        let plain = build_rtt_test_event(&relay, &keys, None).unwrap();
        let nonce_tag = plain
            .tags
            .iter()
            .any(|tag| tag.as_slice().first().map(String::as_str) == Some("nonce"));
        assert!(!nonce_tag);
    }
}
