//! YAML-backed configuration models for the database layer and the five
//! services.
//!
//! Every service reads one YAML file containing a `database` section and
//! its own sections. All fields carry defaults so a minimal file is
//! valid; `validate()` enforces the cross-field constraints at startup
//! (fail-fast, exit code 1). Secrets are never read from the file: the
//! database password and the monitor/synchronizer signing key come from
//! the environment variables named in the config.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BigBrotrError, Result};
use crate::models::relay::Network;

pub fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&raw)?)
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Environment variable holding the password. Never stored in YAML.
    pub password_env: String,
    pub limits: PoolLimitsConfig,
    pub retry: PoolRetryConfig,
    pub server: ServerSettingsConfig,
    pub batch: BatchConfig,
    pub timeouts: DbTimeoutsConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "bigbrotr".to_string(),
            user: "admin".to_string(),
            password_env: "DB_ADMIN_PASSWORD".to_string(),
            limits: PoolLimitsConfig::default(),
            retry: PoolRetryConfig::default(),
            server: ServerSettingsConfig::default(),
            batch: BatchConfig::default(),
            timeouts: DbTimeoutsConfig::default(),
        }
    }
}

impl DatabaseConfig {
    pub fn resolve_password(&self) -> Result<String> {
        std::env::var(&self.password_env).map_err(|_| {
            BigBrotrError::Configuration(format!(
                "{} environment variable not set",
                self.password_env
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() || self.database.is_empty() || self.user.is_empty() {
            return Err(BigBrotrError::Configuration(
                "database host, name and user must not be empty".to_string(),
            ));
        }
        self.limits.validate()?;
        self.retry.validate()?;
        self.batch.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolLimitsConfig {
    pub min_size: u32,
    pub max_size: u32,
    /// Idle connections are closed after this many seconds.
    pub idle_lifetime_s: u64,
    /// Connections are recycled after this many seconds regardless of
    /// use (sqlx recycles by age rather than by query count).
    pub max_lifetime_s: u64,
    pub acquisition_timeout_s: u64,
}

impl Default for PoolLimitsConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 20,
            idle_lifetime_s: 300,
            max_lifetime_s: 1800,
            acquisition_timeout_s: 10,
        }
    }
}

impl PoolLimitsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 {
            return Err(BigBrotrError::Configuration(
                "pool min_size must be at least 1".to_string(),
            ));
        }
        if self.max_size < self.min_size {
            return Err(BigBrotrError::Configuration(format!(
                "pool max_size ({}) must be >= min_size ({})",
                self.max_size, self.min_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolRetryConfig {
    pub max_attempts: u32,
    pub initial_delay_s: f64,
    pub max_delay_s: f64,
    pub exponential_backoff: bool,
}

impl Default for PoolRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_s: 1.0,
            max_delay_s: 10.0,
            exponential_backoff: true,
        }
    }
}

impl PoolRetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BigBrotrError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_delay_s < self.initial_delay_s {
            return Err(BigBrotrError::Configuration(format!(
                "retry max_delay ({}) must be >= initial_delay ({})",
                self.max_delay_s, self.initial_delay_s
            )));
        }
        Ok(())
    }

    /// Backoff delay for the given zero-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = if self.exponential_backoff {
            self.initial_delay_s * 2f64.powi(attempt as i32)
        } else {
            self.initial_delay_s * f64::from(attempt + 1)
        };
        Duration::from_secs_f64(delay.min(self.max_delay_s))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettingsConfig {
    pub application_name: String,
    pub timezone: String,
    /// Server-side statement timeout in milliseconds (0 = unlimited).
    pub statement_timeout_ms: u64,
}

impl Default for ServerSettingsConfig {
    fn default() -> Self {
        Self {
            application_name: "bigbrotr".to_string(),
            timezone: "UTC".to_string(),
            statement_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub max_size: usize,
}

pub const BATCH_HARD_CAP: usize = 100_000;

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_size: 1000 }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 || self.max_size > BATCH_HARD_CAP {
            return Err(BigBrotrError::Configuration(format!(
                "batch max_size must be in 1..={BATCH_HARD_CAP}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DbTimeoutsConfig {
    pub query_s: Option<f64>,
    pub batch_s: Option<f64>,
    pub cleanup_s: Option<f64>,
    /// `None` means no limit: a concurrent materialized view refresh can
    /// take minutes on large tables.
    pub refresh_s: Option<f64>,
}

impl Default for DbTimeoutsConfig {
    fn default() -> Self {
        Self {
            query_s: Some(60.0),
            batch_s: Some(120.0),
            cleanup_s: Some(90.0),
            refresh_s: None,
        }
    }
}

impl DbTimeoutsConfig {
    pub fn query(&self) -> Option<Duration> {
        self.query_s.map(Duration::from_secs_f64)
    }
    pub fn batch(&self) -> Option<Duration> {
        self.batch_s.map(Duration::from_secs_f64)
    }
    pub fn cleanup(&self) -> Option<Duration> {
        self.cleanup_s.map(Duration::from_secs_f64)
    }
    pub fn refresh(&self) -> Option<Duration> {
        self.refresh_s.map(Duration::from_secs_f64)
    }
}

// ---------------------------------------------------------------------------
// Service base
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BaseServiceConfig {
    /// Seconds between run cycles.
    pub interval: f64,
    /// Stop after this many consecutive errors (0 = unlimited).
    pub max_consecutive_failures: u32,
    pub metrics: MetricsConfig,
}

impl Default for BaseServiceConfig {
    fn default() -> Self {
        Self {
            interval: 300.0,
            max_consecutive_failures: 5,
            metrics: MetricsConfig::default(),
        }
    }
}

impl BaseServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval < 1.0 {
            return Err(BigBrotrError::Configuration(
                "service interval must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8000,
            path: "/metrics".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Networks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub enabled: bool,
    /// SOCKS5 proxy URL for overlay networks.
    pub proxy_url: Option<String>,
    /// Environment variable that overrides `proxy_url` when set.
    pub proxy_env: Option<String>,
    /// Maximum concurrent relay connections on this network.
    pub max_tasks: usize,
    /// Per-connection timeout in seconds.
    pub timeout_s: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_url: None,
            proxy_env: None,
            max_tasks: 20,
            timeout_s: 10.0,
        }
    }
}

impl NetworkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }

    /// Proxy resolution: environment variable wins over the YAML value.
    pub fn resolve_proxy(&self) -> Option<String> {
        if let Some(env) = &self.proxy_env {
            if let Ok(value) = std::env::var(env) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        self.proxy_url.clone()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworksConfig {
    pub clearnet: NetworkConfig,
    pub tor: NetworkConfig,
    pub i2p: NetworkConfig,
    pub loki: NetworkConfig,
}

impl Default for NetworksConfig {
    fn default() -> Self {
        Self {
            clearnet: NetworkConfig {
                enabled: true,
                proxy_url: None,
                proxy_env: None,
                max_tasks: 100,
                timeout_s: 10.0,
            },
            tor: NetworkConfig {
                proxy_url: Some("socks5h://127.0.0.1:9050".to_string()),
                proxy_env: Some("BIGBROTR_TOR_PROXY".to_string()),
                ..NetworkConfig::default()
            },
            i2p: NetworkConfig {
                proxy_url: Some("socks5h://127.0.0.1:4447".to_string()),
                proxy_env: Some("BIGBROTR_I2P_PROXY".to_string()),
                ..NetworkConfig::default()
            },
            loki: NetworkConfig {
                proxy_url: Some("socks5h://127.0.0.1:9050".to_string()),
                proxy_env: Some("BIGBROTR_LOKI_PROXY".to_string()),
                ..NetworkConfig::default()
            },
        }
    }
}

impl NetworksConfig {
    pub fn get(&self, network: Network) -> &NetworkConfig {
        match network {
            Network::Clearnet => &self.clearnet,
            Network::Tor => &self.tor,
            Network::I2p => &self.i2p,
            Network::Loki => &self.loki,
        }
    }

    pub fn enabled_networks(&self) -> Vec<Network> {
        Network::ALL
            .into_iter()
            .filter(|n| self.get(*n).enabled)
            .collect()
    }

    pub fn is_enabled(&self, network: Network) -> bool {
        self.get(network).enabled
    }
}

// ---------------------------------------------------------------------------
// Signing keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeysConfig {
    /// Environment variable holding the hex or bech32 secret key.
    pub secret_key_env: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            secret_key_env: "BIGBROTR_SECRET_KEY".to_string(),
        }
    }
}

impl KeysConfig {
    pub fn load(&self) -> Result<nostr_sdk::Keys> {
        let raw = std::env::var(&self.secret_key_env).map_err(|_| {
            BigBrotrError::Configuration(format!(
                "{} environment variable not set",
                self.secret_key_env
            ))
        })?;
        Ok(nostr_sdk::Keys::parse(&raw)?)
    }
}

// ---------------------------------------------------------------------------
// Seeder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeederConfig {
    pub database: DatabaseConfig,
    pub service: BaseServiceConfig,
    pub seed: SeedConfig,
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            service: BaseServiceConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

impl SeederConfig {
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.service.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeedConfig {
    pub file_path: String,
    /// `true` inserts candidates for the validator; `false` bypasses
    /// validation and writes relay rows directly.
    pub to_validate: bool,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            file_path: "seed/relays.txt".to_string(),
            to_validate: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Finder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FinderConfig {
    pub database: DatabaseConfig,
    pub service: BaseServiceConfig,
    pub concurrency: FinderConcurrencyConfig,
    pub events: EventsScanConfig,
    pub api: ApiConfig,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            service: BaseServiceConfig::default(),
            concurrency: FinderConcurrencyConfig::default(),
            events: EventsScanConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl FinderConfig {
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.service.validate()?;
        for source in &self.api.sources {
            source.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FinderConcurrencyConfig {
    /// Maximum concurrent relay event scans.
    pub max_parallel_events: usize,
}

impl Default for FinderConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_events: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsScanConfig {
    pub enabled: bool,
    /// Events to process per cursor page.
    pub batch_size: i64,
}

impl Default for EventsScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub enabled: bool,
    pub sources: Vec<ApiSourceConfig>,
    pub delay_between_requests_s: f64,
    pub verify_ssl: bool,
    /// Maximum API response body size in bytes.
    pub max_response_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sources: vec![
                ApiSourceConfig::new("https://api.nostr.watch/v1/online"),
                ApiSourceConfig::new("https://api.nostr.watch/v1/offline"),
            ],
            delay_between_requests_s: 1.0,
            verify_ssl: true,
            max_response_size: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiSourceConfig {
    pub url: String,
    pub enabled: bool,
    pub timeout_s: f64,
    pub connect_timeout_s: f64,
    /// JMESPath expression extracting an array of URL strings from the
    /// JSON response. The default assumes a flat array of strings.
    pub jmespath: String,
}

impl Default for ApiSourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            enabled: true,
            timeout_s: 30.0,
            connect_timeout_s: 10.0,
            jmespath: "[*]".to_string(),
        }
    }
}

impl ApiSourceConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(BigBrotrError::Configuration(
                "api source url must not be empty".to_string(),
            ));
        }
        if self.connect_timeout_s > self.timeout_s {
            return Err(BigBrotrError::Configuration(format!(
                "api source {}: connect_timeout ({}) must not exceed timeout ({})",
                self.url, self.connect_timeout_s, self.timeout_s
            )));
        }
        jmespath::compile(&self.jmespath).map_err(|e| {
            BigBrotrError::Configuration(format!("invalid JMESPath expression: {e}"))
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorConfig {
    pub database: DatabaseConfig,
    pub service: BaseServiceConfig,
    pub networks: NetworksConfig,
    pub processing: ValidatorProcessingConfig,
    pub cleanup: CandidateCleanupConfig,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            service: BaseServiceConfig::default(),
            networks: NetworksConfig::default(),
            processing: ValidatorProcessingConfig::default(),
            cleanup: CandidateCleanupConfig::default(),
        }
    }
}

impl ValidatorConfig {
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.service.validate()?;
        if self.processing.chunk_size == 0 {
            return Err(BigBrotrError::Configuration(
                "processing chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorProcessingConfig {
    /// Candidates fetched and probed per iteration.
    pub chunk_size: i64,
    /// Optional cap on total candidates per cycle.
    pub max_candidates: Option<i64>,
}

impl Default for ValidatorProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_candidates: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CandidateCleanupConfig {
    pub enabled: bool,
    /// Candidates with at least this many failures are deleted.
    pub max_failures: i64,
}

impl Default for CandidateCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_failures: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub database: DatabaseConfig,
    pub service: BaseServiceConfig,
    pub networks: NetworksConfig,
    pub keys: KeysConfig,
    pub processing: MonitorProcessingConfig,
    pub geo: GeoConfig,
    pub publishing: PublishingConfig,
    pub discovery: DiscoveryConfig,
    pub announcement: AnnouncementConfig,
    pub profile: ProfileConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            service: BaseServiceConfig::default(),
            networks: NetworksConfig::default(),
            keys: KeysConfig::default(),
            processing: MonitorProcessingConfig::default(),
            geo: GeoConfig::default(),
            publishing: PublishingConfig::default(),
            discovery: DiscoveryConfig::default(),
            announcement: AnnouncementConfig::default(),
            profile: ProfileConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.service.validate()?;

        let stored_not_computed = self
            .processing
            .store
            .missing_from(&self.processing.compute);
        if !stored_not_computed.is_empty() {
            return Err(BigBrotrError::Configuration(format!(
                "cannot store metadata that is not computed: {}",
                stored_not_computed.join(", ")
            )));
        }
        if self.discovery.enabled {
            let published_not_computed = self
                .discovery
                .include
                .missing_from(&self.processing.compute);
            if !published_not_computed.is_empty() {
                return Err(BigBrotrError::Configuration(format!(
                    "cannot publish metadata that is not computed: {}",
                    published_not_computed.join(", ")
                )));
            }
        }
        if self.processing.compute.nip66_geo
            && !Path::new(&self.geo.city_database_path).exists()
            && self.geo.city_download_url.is_empty()
        {
            return Err(BigBrotrError::Configuration(format!(
                "GeoLite2 City database not found at {} and no download URL configured",
                self.geo.city_database_path
            )));
        }
        if self.processing.compute.nip66_net
            && !Path::new(&self.geo.asn_database_path).exists()
            && self.geo.asn_download_url.is_empty()
        {
            return Err(BigBrotrError::Configuration(format!(
                "GeoLite2 ASN database not found at {} and no download URL configured",
                self.geo.asn_database_path
            )));
        }
        Ok(())
    }
}

/// Boolean flags naming the seven metadata types. Used three ways:
/// which checks run (`compute`), which results persist (`store`) and
/// which results are published as NIP-66 tags (`discovery.include`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetadataFlags {
    pub nip11_info: bool,
    pub nip66_rtt: bool,
    pub nip66_ssl: bool,
    pub nip66_geo: bool,
    pub nip66_net: bool,
    pub nip66_dns: bool,
    pub nip66_http: bool,
}

impl Default for MetadataFlags {
    fn default() -> Self {
        Self {
            nip11_info: true,
            nip66_rtt: true,
            nip66_ssl: true,
            nip66_geo: true,
            nip66_net: true,
            nip66_dns: true,
            nip66_http: true,
        }
    }
}

impl MetadataFlags {
    /// Flags enabled in self but disabled in `superset`.
    pub fn missing_from(&self, superset: &MetadataFlags) -> Vec<&'static str> {
        let pairs = [
            ("nip11_info", self.nip11_info, superset.nip11_info),
            ("nip66_rtt", self.nip66_rtt, superset.nip66_rtt),
            ("nip66_ssl", self.nip66_ssl, superset.nip66_ssl),
            ("nip66_geo", self.nip66_geo, superset.nip66_geo),
            ("nip66_net", self.nip66_net, superset.nip66_net),
            ("nip66_dns", self.nip66_dns, superset.nip66_dns),
            ("nip66_http", self.nip66_http, superset.nip66_http),
        ];
        pairs
            .into_iter()
            .filter(|(_, own, sup)| *own && !*sup)
            .map(|(name, _, _)| name)
            .collect()
    }
}

/// Retry settings with exponential backoff and uniform jitter for one
/// metadata check type.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckRetryConfig {
    pub max_attempts: u32,
    pub initial_delay_s: f64,
    pub max_delay_s: f64,
    pub jitter_s: f64,
}

impl Default for CheckRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_s: 1.0,
            max_delay_s: 10.0,
            jitter_s: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckRetriesConfig {
    pub nip11_info: CheckRetryConfig,
    pub nip66_rtt: CheckRetryConfig,
    pub nip66_ssl: CheckRetryConfig,
    pub nip66_geo: CheckRetryConfig,
    pub nip66_net: CheckRetryConfig,
    pub nip66_dns: CheckRetryConfig,
    pub nip66_http: CheckRetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorProcessingConfig {
    pub chunk_size: usize,
    pub max_relays: Option<usize>,
    /// Fall back to non-validating TLS on certificate errors.
    pub allow_insecure: bool,
    /// Size cap for NIP-11 info documents in bytes.
    pub nip11_info_max_size: usize,
    pub retries: CheckRetriesConfig,
    pub compute: MetadataFlags,
    pub store: MetadataFlags,
}

impl Default for MonitorProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_relays: None,
            allow_insecure: false,
            nip11_info_max_size: 1024 * 1024,
            retries: CheckRetriesConfig::default(),
            compute: MetadataFlags::default(),
            store: MetadataFlags::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeoConfig {
    pub city_database_path: String,
    pub asn_database_path: String,
    pub city_download_url: String,
    pub asn_download_url: String,
    /// Databases older than this are re-downloaded. `None` disables the
    /// staleness check.
    pub max_age_days: Option<u64>,
    /// Download size cap per database file in bytes.
    pub max_download_size: usize,
    /// Geohash precision (9 is roughly five meters).
    pub geohash_precision: usize,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            city_database_path: "static/GeoLite2-City.mmdb".to_string(),
            asn_database_path: "static/GeoLite2-ASN.mmdb".to_string(),
            city_download_url:
                "https://github.com/P3TERX/GeoLite.mmdb/raw/download/GeoLite2-City.mmdb"
                    .to_string(),
            asn_download_url:
                "https://github.com/P3TERX/GeoLite.mmdb/raw/download/GeoLite2-ASN.mmdb"
                    .to_string(),
            max_age_days: Some(30),
            max_download_size: 100_000_000,
            geohash_precision: 9,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishingConfig {
    /// Fallback relay URL list used by discovery/announcement/profile
    /// publication when they do not declare their own.
    pub relays: Vec<String>,
    /// Per-broadcast timeout in seconds.
    pub timeout_s: f64,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            timeout_s: 30.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Seconds between checks of the same relay.
    pub interval: i64,
    pub include: MetadataFlags,
    pub relays: Option<Vec<String>>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 3600,
            include: MetadataFlags::default(),
            relays: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnnouncementConfig {
    pub enabled: bool,
    pub interval: i64,
    pub relays: Option<Vec<String>>,
}

impl Default for AnnouncementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 86_400,
            relays: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    pub enabled: bool,
    pub interval: i64,
    pub relays: Option<Vec<String>>,
    pub name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub nip05: Option<String>,
    pub website: Option<String>,
    pub banner: Option<String>,
    pub lud16: Option<String>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 86_400,
            relays: None,
            name: None,
            about: None,
            picture: None,
            nip05: None,
            website: None,
            banner: None,
            lud16: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SynchronizerConfig {
    pub database: DatabaseConfig,
    pub service: BaseServiceConfig,
    pub networks: NetworksConfig,
    pub keys: KeysConfig,
    pub filter: SyncFilterConfig,
    pub time_range: TimeRangeConfig,
    pub timeouts: SyncTimeoutsConfig,
    pub concurrency: SyncConcurrencyConfig,
    pub source: SyncSourceConfig,
    pub overrides: Vec<RelayOverride>,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            service: BaseServiceConfig::default(),
            networks: NetworksConfig::default(),
            keys: KeysConfig::default(),
            filter: SyncFilterConfig::default(),
            time_range: TimeRangeConfig::default(),
            timeouts: SyncTimeoutsConfig::default(),
            concurrency: SyncConcurrencyConfig::default(),
            source: SyncSourceConfig::default(),
            overrides: Vec::new(),
        }
    }
}

impl SynchronizerConfig {
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.service.validate()?;
        self.filter.validate()?;
        if !(3_600..=604_800).contains(&self.time_range.lookback_seconds) {
            return Err(BigBrotrError::Configuration(
                "time_range lookback_seconds must be within 1 hour..=7 days".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-relay timeout resolution: per-relay override > per-network
    /// default.
    pub fn relay_timeout(&self, url: &str, network: Network) -> Duration {
        for o in &self.overrides {
            if o.url == url {
                if let Some(secs) = o.timeouts.relay_s {
                    return Duration::from_secs_f64(secs);
                }
            }
        }
        self.timeouts.relay_timeout(network)
    }

    /// Per-request timeout resolution: per-relay override > per-network
    /// default.
    pub fn request_timeout(&self, url: &str, network: Network) -> Duration {
        for o in &self.overrides {
            if o.url == url {
                if let Some(secs) = o.timeouts.request_s {
                    return Duration::from_secs_f64(secs);
                }
            }
        }
        self.networks.get(network).timeout()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncFilterConfig {
    pub ids: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    pub authors: Option<Vec<String>>,
    pub tags: Option<HashMap<String, Vec<String>>>,
    pub limit: usize,
}

impl Default for SyncFilterConfig {
    fn default() -> Self {
        Self {
            ids: None,
            kinds: None,
            authors: None,
            tags: None,
            limit: 500,
        }
    }
}

impl SyncFilterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=5000).contains(&self.limit) {
            return Err(BigBrotrError::Configuration(
                "filter limit must be within 1..=5000".to_string(),
            ));
        }
        for list in [&self.ids, &self.authors].into_iter().flatten() {
            for value in list {
                if value.len() != 64 || hex::decode(value).is_err() {
                    return Err(BigBrotrError::Configuration(format!(
                        "invalid hex string in filter: {value}"
                    )));
                }
            }
        }
        if let Some(tags) = &self.tags {
            for key in tags.keys() {
                if key.len() != 1 || !key.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Err(BigBrotrError::Configuration(format!(
                        "tag filter keys must be single letters, got: {key}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeRangeConfig {
    /// Start timestamp when a relay has no cursor (0 = epoch).
    pub default_start: i64,
    /// Use per-relay cursors for the window start.
    pub use_relay_state: bool,
    /// The window end is `now - lookback_seconds`.
    pub lookback_seconds: i64,
}

impl Default for TimeRangeConfig {
    fn default() -> Self {
        Self {
            default_start: 0,
            use_relay_state: true,
            lookback_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncTimeoutsConfig {
    pub relay_clearnet_s: f64,
    pub relay_tor_s: f64,
    pub relay_i2p_s: f64,
    pub relay_loki_s: f64,
}

impl Default for SyncTimeoutsConfig {
    fn default() -> Self {
        Self {
            relay_clearnet_s: 1800.0,
            relay_tor_s: 3600.0,
            relay_i2p_s: 3600.0,
            relay_loki_s: 3600.0,
        }
    }
}

impl SyncTimeoutsConfig {
    pub fn relay_timeout(&self, network: Network) -> Duration {
        let secs = match network {
            Network::Clearnet => self.relay_clearnet_s,
            Network::Tor => self.relay_tor_s,
            Network::I2p => self.relay_i2p_s,
            Network::Loki => self.relay_loki_s,
        };
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConcurrencyConfig {
    /// Flush buffered cursor updates every N completed relays.
    pub cursor_flush_interval: usize,
}

impl Default for SyncConcurrencyConfig {
    fn default() -> Self {
        Self {
            cursor_flush_interval: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSourceConfig {
    pub from_database: bool,
}

impl Default for SyncSourceConfig {
    fn default() -> Self {
        Self {
            from_database: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayOverride {
    pub url: String,
    #[serde(default)]
    pub timeouts: RelayOverrideTimeouts,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayOverrideTimeouts {
    pub request_s: Option<f64>,
    pub relay_s: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config: ValidatorConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.service.interval, 300.0);
        assert_eq!(config.processing.chunk_size, 100);
        assert_eq!(config.cleanup.max_failures, 100);
        assert!(config.networks.clearnet.enabled);
        assert!(!config.networks.tor.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_network_override_keeps_defaults() {
        let yaml = r#"
networks:
  tor:
    enabled: true
"#;
        let config: ValidatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.networks.tor.enabled);
        // The per-section default replaces the whole NetworkConfig, so
        // the generic overlay defaults apply.
        assert_eq!(config.networks.tor.max_tasks, 20);
        assert!(config.networks.clearnet.enabled);
    }

    #[test]
    fn test_pool_limits_validation() {
        let yaml = r#"
database:
  limits:
    min_size: 10
    max_size: 2
"#;
        let config: ValidatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_delay_exponential_and_capped() {
        let retry = PoolRetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs_f64(1.0));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs_f64(2.0));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs_f64(4.0));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_secs_f64(10.0));

        let linear = PoolRetryConfig {
            exponential_backoff: false,
            ..PoolRetryConfig::default()
        };
        assert_eq!(linear.delay_for_attempt(2), Duration::from_secs_f64(3.0));
    }

    #[test]
    fn test_monitor_store_requires_compute() {
        let yaml = r#"
processing:
  compute:
    nip66_ssl: false
  store:
    nip66_ssl: true
"#;
        let config: MonitorConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("nip66_ssl"));
    }

    #[test]
    fn test_monitor_publish_requires_compute() {
        let yaml = r#"
processing:
  compute:
    nip66_geo: false
  store:
    nip66_geo: false
discovery:
  include:
    nip66_geo: true
"#;
        let config: MonitorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_filter_validation() {
        let bad_hex = SyncFilterConfig {
            ids: Some(vec!["zz".to_string()]),
            ..SyncFilterConfig::default()
        };
        assert!(bad_hex.validate().is_err());

        let bad_limit = SyncFilterConfig {
            limit: 50_000,
            ..SyncFilterConfig::default()
        };
        assert!(bad_limit.validate().is_err());

        let good = SyncFilterConfig {
            ids: Some(vec![
                "ab".repeat(32),
            ]),
            limit: 500,
            ..SyncFilterConfig::default()
        };
        good.validate().unwrap();
    }

    #[test]
    fn test_relay_override_precedence() {
        let yaml = r#"
overrides:
  - url: "wss://big.relay.example"
    timeouts:
      relay_s: 7200.0
"#;
        let config: SynchronizerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.relay_timeout("wss://big.relay.example", Network::Clearnet),
            Duration::from_secs(7200)
        );
        assert_eq!(
            config.relay_timeout("wss://other.example", Network::Clearnet),
            Duration::from_secs(1800)
        );
        assert_eq!(
            config.relay_timeout("wss://other.example", Network::Tor),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_invalid_jmespath_rejected() {
        let source = ApiSourceConfig {
            url: "https://api.example.com".to_string(),
            jmespath: "[".to_string(),
            ..ApiSourceConfig::default()
        };
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = r#"
service:
  interval: 120
  no_such_field: true
"#;
        let parsed: std::result::Result<ValidatorConfig, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());
    }
}
