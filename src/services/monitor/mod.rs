//! Monitor service: health-check orchestration with NIP-66 compliance.
//!
//! Each cycle refreshes the GeoLite2 databases, publishes the kind-0
//! profile and kind-10166 announcement when their intervals elapse,
//! fetches relays due for a check (least-recently-checked first),
//! processes them in chunks under the per-network semaphores, publishes
//! one kind-30166 discovery event per successful relay, and persists
//! content-addressed metadata plus monitoring markers for every
//! checked relay.

pub mod checks;
pub mod tags;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use nostr_sdk::prelude::*;
use serde_json::json;
use tokio::task::JoinSet;

use crate::config::{BaseServiceConfig, MonitorConfig};
use crate::database::Database;
use crate::error::Result;
use crate::models::relay::Relay;
use crate::models::service_state::{ServiceName, ServiceState, StateType};
use crate::models::{Metadata, MetadataType, RelayMetadata};
use crate::services::queries;
use crate::services::{ChunkProgress, NetworkSemaphores, Service, Shutdown};
use crate::transport;

use checks::{CheckResult, GeoReaders};

const SECONDS_PER_DAY: u64 = 86_400;

pub struct Monitor {
    db: Arc<Database>,
    config: Arc<MonitorConfig>,
    shutdown: Shutdown,
    keys: Keys,
    progress: ChunkProgress,
    readers: GeoReaders,
}

impl Monitor {
    pub fn new(db: Arc<Database>, config: MonitorConfig, shutdown: Shutdown) -> Result<Self> {
        let keys = config.keys.load()?;
        Ok(Self {
            db,
            config: Arc::new(config),
            shutdown,
            keys,
            progress: ChunkProgress::new(),
            readers: GeoReaders::default(),
        })
    }

    // -----------------------------------------------------------------------
    // GeoLite2 maintenance
    // -----------------------------------------------------------------------

    /// Download or refresh both databases. Failures are logged, never
    /// fatal: the cycle proceeds with a stale or missing database.
    async fn update_geo_databases(&self) {
        let compute = &self.config.processing.compute;
        let geo = &self.config.geo;

        let mut updates: Vec<(&str, &str, &str)> = Vec::new();
        if compute.nip66_geo {
            updates.push((&geo.city_database_path, &geo.city_download_url, "city"));
        }
        if compute.nip66_net {
            updates.push((&geo.asn_database_path, &geo.asn_download_url, "asn"));
        }

        for (path, url, name) in updates {
            if let Err(e) = self.update_geo_db(Path::new(path), url, name).await {
                tracing::warn!(
                    target: "bigbrotr::services::monitor",
                    db = name,
                    error = %e,
                    "geo_db_update_failed"
                );
            }
        }
    }

    async fn update_geo_db(&self, path: &Path, url: &str, db_name: &str) -> Result<()> {
        if url.is_empty() {
            return Ok(());
        }
        if path.exists() {
            let Some(max_age_days) = self.config.geo.max_age_days else {
                return Ok(());
            };
            let age = std::fs::metadata(path)?
                .modified()?
                .elapsed()
                .unwrap_or_default();
            if age.as_secs() <= max_age_days * SECONDS_PER_DAY {
                return Ok(());
            }
            tracing::info!(
                target: "bigbrotr::services::monitor",
                db = db_name,
                age_days = age.as_secs() / SECONDS_PER_DAY,
                "updating_geo_db"
            );
        } else {
            tracing::info!(target: "bigbrotr::services::monitor", db = db_name, "downloading_geo_db");
        }

        self.download_bounded(url, path).await
    }

    /// Stream a download to `path` with a size cap, writing through a
    /// temporary file so a partial download never replaces a good
    /// database.
    async fn download_bounded(&self, url: &str, path: &Path) -> Result<()> {
        let max_size = self.config.geo.max_download_size;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = path.with_extension("download");

        let response = reqwest::get(url).await?.error_for_status()?;
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len();
            if written > max_size {
                drop(file);
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(crate::error::BigBrotrError::Other(anyhow::anyhow!(
                    "download exceeds {max_size} bytes"
                )));
            }
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        drop(file);
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Publication (kind 0 / 10166 / 30166)
    // -----------------------------------------------------------------------

    fn publish_relays(&self, section: &Option<Vec<String>>) -> Vec<String> {
        section
            .clone()
            .unwrap_or_else(|| self.config.publishing.relays.clone())
    }

    /// Publish a signed event when its interval elapsed, tracked by a
    /// `publication` state row. Partial broadcast success counts.
    async fn publish_if_due(
        &self,
        enabled: bool,
        relays: Vec<String>,
        interval: i64,
        state_key: &str,
        builder: EventBuilder,
        event_name: &str,
    ) -> Result<()> {
        if !enabled || relays.is_empty() {
            return Ok(());
        }

        let states = self
            .db
            .get_service_state(ServiceName::Monitor, StateType::Publication, Some(state_key))
            .await?;
        let last_published = states
            .first()
            .and_then(|s| s.value_i64("published_at"))
            .unwrap_or(0);
        let now = chrono::Utc::now().timestamp();
        if now - last_published < interval {
            return Ok(());
        }

        let event = builder.sign_with_keys(&self.keys)?;
        let timeout = std::time::Duration::from_secs_f64(self.config.publishing.timeout_s);
        let sent = transport::broadcast_events(&[event], &relays, timeout).await?;
        if sent == 0 {
            tracing::warn!(
                target: "bigbrotr::services::monitor",
                event = event_name,
                error = "no relays reachable",
                "publish_failed"
            );
            return Ok(());
        }

        tracing::info!(
            target: "bigbrotr::services::monitor",
            event = event_name,
            relays = relays.len(),
            "publish_completed"
        );
        let now = chrono::Utc::now().timestamp();
        self.db
            .upsert_service_state(&[ServiceState::new(
                ServiceName::Monitor,
                StateType::Publication,
                state_key,
                json!({"published_at": now}),
                now,
            )?])
            .await?;
        Ok(())
    }

    async fn publish_profile(&self) -> Result<()> {
        let profile = &self.config.profile;
        self.publish_if_due(
            profile.enabled,
            self.publish_relays(&profile.relays),
            profile.interval,
            "last_profile",
            tags::build_profile_event(profile),
            "profile",
        )
        .await
    }

    async fn publish_announcement(&self) -> Result<()> {
        let announcement = &self.config.announcement;
        let timeout_ms = (self.config.networks.clearnet.timeout_s * 1000.0) as u64;
        self.publish_if_due(
            announcement.enabled,
            self.publish_relays(&announcement.relays),
            announcement.interval,
            "last_announcement",
            tags::build_monitor_announcement(
                self.config.service.interval as u64,
                timeout_ms,
                &self.config.discovery.include,
            ),
            "announcement",
        )
        .await
    }

    /// One kind-30166 event per successful relay in the chunk.
    async fn publish_relay_discoveries(&self, successful: &[(Relay, CheckResult)]) {
        let discovery = &self.config.discovery;
        let relays = self.publish_relays(&discovery.relays);
        if !discovery.enabled || relays.is_empty() || successful.is_empty() {
            return;
        }

        let mut events = Vec::with_capacity(successful.len());
        for (relay, result) in successful {
            match tags::build_relay_discovery(relay, result, &discovery.include)
                .and_then(|builder| Ok(builder.sign_with_keys(&self.keys)?))
            {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::debug!(
                        target: "bigbrotr::services::monitor",
                        url = %relay.url,
                        error = %e,
                        "build_30166_failed"
                    );
                }
            }
        }
        if events.is_empty() {
            return;
        }

        let timeout = std::time::Duration::from_secs_f64(self.config.publishing.timeout_s);
        match transport::broadcast_events(&events, &relays, timeout).await {
            Ok(0) => {
                tracing::warn!(
                    target: "bigbrotr::services::monitor",
                    count = events.len(),
                    error = "no relays reachable",
                    "discoveries_broadcast_failed"
                );
            }
            Ok(sent) => {
                tracing::debug!(
                    target: "bigbrotr::services::monitor",
                    count = sent,
                    "discoveries_published"
                );
            }
            Err(e) => {
                tracing::warn!(
                    target: "bigbrotr::services::monitor",
                    count = events.len(),
                    error = %e,
                    "discoveries_broadcast_failed"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Checking
    // -----------------------------------------------------------------------

    /// Probe every relay in the chunk concurrently under the network
    /// semaphores; split into successes (any data) and failures.
    async fn check_chunk(
        &self,
        chunk: Vec<Relay>,
        semaphores: &NetworkSemaphores,
    ) -> (Vec<(Relay, CheckResult)>, Vec<Relay>) {
        let mut tasks: JoinSet<(Relay, CheckResult)> = JoinSet::new();
        for relay in chunk {
            let config = self.config.clone();
            let keys = self.keys.clone();
            let readers = self.readers.clone();
            let shutdown = self.shutdown.clone();
            let semaphore = semaphores.get(relay.network);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (relay, CheckResult::default());
                };
                if !shutdown.is_running() {
                    return (relay, CheckResult::default());
                }
                let result = checks::check_relay(&relay, &config, &keys, &readers, &shutdown).await;
                (relay, result)
            });
        }

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((relay, result)) if result.has_data() => successful.push((relay, result)),
                Ok((relay, _)) => failed.push(relay),
                Err(e) => {
                    tracing::error!(
                        target: "bigbrotr::services::monitor",
                        error = %e,
                        "check_worker_failed"
                    );
                }
            }
        }
        (successful, failed)
    }

    /// Persist metadata for successful checks (honoring the `store`
    /// flags) and monitoring markers plus checkpoints for every checked
    /// relay, so a down relay is not re-dialed within the interval.
    async fn persist_results(
        &self,
        successful: &[(Relay, CheckResult)],
        failed: &[Relay],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let store = &self.config.processing.store;

        let mut records: Vec<RelayMetadata> = Vec::new();
        for (relay, result) in successful {
            let mut push = |metadata_type: MetadataType,
                            value: Option<serde_json::Value>|
             -> Result<()> {
                if let Some(value) = value {
                    records.push(RelayMetadata::new(
                        relay.clone(),
                        Metadata::new(metadata_type, value)?,
                        result.generated_at,
                    )?);
                }
                Ok(())
            };

            if store.nip11_info {
                push(
                    MetadataType::Nip11Info,
                    result.nip11.as_ref().map(|i| i.probe.to_metadata_value()),
                )?;
            }
            if store.nip66_rtt {
                push(
                    MetadataType::Nip66Rtt,
                    result.rtt.as_ref().map(|p| p.to_metadata_value()),
                )?;
            }
            if store.nip66_ssl {
                push(
                    MetadataType::Nip66Ssl,
                    result.ssl.as_ref().map(|p| p.to_metadata_value()),
                )?;
            }
            if store.nip66_geo {
                push(
                    MetadataType::Nip66Geo,
                    result.geo.as_ref().map(|p| p.to_metadata_value()),
                )?;
            }
            if store.nip66_net {
                push(
                    MetadataType::Nip66Net,
                    result.net.as_ref().map(|p| p.to_metadata_value()),
                )?;
            }
            if store.nip66_dns {
                push(
                    MetadataType::Nip66Dns,
                    result.dns.as_ref().map(|p| p.to_metadata_value()),
                )?;
            }
            if store.nip66_http {
                push(
                    MetadataType::Nip66Http,
                    result.http.as_ref().map(|p| p.to_metadata_value()),
                )?;
            }
        }

        for chunk in records.chunks(self.db.config().batch.max_size) {
            match self.db.insert_relay_metadata(chunk, true).await {
                Ok(count) => {
                    tracing::debug!(
                        target: "bigbrotr::services::monitor",
                        count,
                        "metadata_inserted"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        target: "bigbrotr::services::monitor",
                        error = %e,
                        count = chunk.len(),
                        "metadata_insert_failed"
                    );
                }
            }
        }

        // Markers go to every checked relay, successful or not
        let mut markers = Vec::new();
        for relay in successful.iter().map(|(r, _)| r).chain(failed.iter()) {
            markers.push(ServiceState::new(
                ServiceName::Monitor,
                StateType::Monitoring,
                relay.url.clone(),
                json!({"monitored_at": now}),
                now,
            )?);
            markers.push(ServiceState::new(
                ServiceName::Monitor,
                StateType::Checkpoint,
                relay.url.clone(),
                json!({"last_check_at": now}),
                now,
            )?);
        }
        for chunk in markers.chunks(self.db.config().batch.max_size) {
            if let Err(e) = self.db.upsert_service_state(chunk).await {
                tracing::error!(
                    target: "bigbrotr::services::monitor",
                    error = %e,
                    "monitoring_save_failed"
                );
            }
        }

        Ok(())
    }

    async fn monitor(&mut self) -> Result<()> {
        let networks: Vec<String> = self
            .config
            .networks
            .enabled_networks()
            .into_iter()
            .map(|n| n.as_str().to_string())
            .collect();
        if networks.is_empty() {
            tracing::warn!(target: "bigbrotr::services::monitor", "no_networks_enabled");
            return Ok(());
        }

        let threshold = self.progress.started_at - self.config.discovery.interval;

        match queries::delete_stale_monitoring_markers(&self.db, threshold).await {
            Ok(0) => {}
            Ok(removed) => {
                tracing::info!(
                    target: "bigbrotr::services::monitor",
                    count = removed,
                    "stale_markers_removed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    target: "bigbrotr::services::monitor",
                    error = %e,
                    "stale_marker_cleanup_failed"
                );
            }
        }

        let mut relays = queries::fetch_relays_due_for_check(&self.db, threshold, &networks).await?;
        if let Some(max_relays) = self.config.processing.max_relays {
            relays.truncate(max_relays);
        }
        self.progress.total = relays.len();
        self.emit_progress_gauges();
        tracing::info!(
            target: "bigbrotr::services::monitor",
            total = self.progress.total,
            "relays_available"
        );

        let semaphores = NetworkSemaphores::new(&self.config.networks);
        let chunk_size = self.config.processing.chunk_size.max(1);

        let mut remaining = relays;
        while !remaining.is_empty() && self.shutdown.is_running() {
            let chunk: Vec<Relay> = remaining
                .drain(..chunk_size.min(remaining.len()))
                .collect();
            let (successful, failed) = self.check_chunk(chunk, &semaphores).await;

            self.progress.record(successful.len(), failed.len());
            self.publish_relay_discoveries(&successful).await;
            self.persist_results(&successful, &failed).await?;
            self.emit_progress_gauges();

            tracing::info!(
                target: "bigbrotr::services::monitor",
                chunk = self.progress.chunks,
                successful = successful.len(),
                failed = failed.len(),
                remaining = self.progress.remaining(),
                "chunk_completed"
            );
        }

        Ok(())
    }

    fn emit_progress_gauges(&self) {
        self.set_gauge("total", self.progress.total as f64);
        self.set_gauge("processed", self.progress.processed as f64);
        self.set_gauge("success", self.progress.succeeded as f64);
        self.set_gauge("failure", self.progress.failed as f64);
    }
}

#[async_trait]
impl Service for Monitor {
    const NAME: ServiceName = ServiceName::Monitor;

    fn base(&self) -> &BaseServiceConfig {
        &self.config.service
    }

    fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    async fn run(&mut self) -> Result<()> {
        tracing::info!(
            target: "bigbrotr::services::monitor",
            chunk_size = self.config.processing.chunk_size,
            max_relays = ?self.config.processing.max_relays,
            networks = ?self.config.networks.enabled_networks(),
            "cycle_started"
        );

        self.progress.reset();
        self.update_geo_databases().await;

        let compute = &self.config.processing.compute;
        let city_path = compute
            .nip66_geo
            .then(|| Path::new(&self.config.geo.city_database_path).to_path_buf());
        let asn_path = compute
            .nip66_net
            .then(|| Path::new(&self.config.geo.asn_database_path).to_path_buf());
        self.readers = GeoReaders::open(city_path.as_deref(), asn_path.as_deref()).await;

        let outcome = async {
            self.publish_profile().await?;
            self.publish_announcement().await?;
            self.monitor().await
        }
        .await;

        // Readers close in reverse acquisition order regardless of how
        // the cycle ended
        self.readers.close();

        outcome?;
        tracing::info!(
            target: "bigbrotr::services::monitor",
            checked = self.progress.processed,
            successful = self.progress.succeeded,
            failed = self.progress.failed,
            chunks = self.progress.chunks,
            duration_s = self.progress.elapsed_secs(),
            "cycle_completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nips::{Probe, ProbeLogs};
    use serde_json::json;

    #[test]
    fn test_publish_relays_fallback() {
        let mut config = MonitorConfig::default();
        config.publishing.relays = vec!["wss://publish.example.com".to_string()];
        config.discovery.relays = None;
        config.announcement.relays = Some(vec!["wss://announce.example.com".to_string()]);

        // Construction requires keys; exercise the fallback logic on
        // the config values directly.
        let discovery_relays = config
            .discovery
            .relays
            .clone()
            .unwrap_or_else(|| config.publishing.relays.clone());
        assert_eq!(discovery_relays, vec!["wss://publish.example.com"]);

        let announcement_relays = config
            .announcement
            .relays
            .clone()
            .unwrap_or_else(|| config.publishing.relays.clone());
        assert_eq!(announcement_relays, vec!["wss://announce.example.com"]);
    }

    #[test]
    fn test_stored_metadata_value_is_content_addressed() {
        // Two relays with identical probe output share one metadata row
        let probe = Probe {
            data: json!({"http_server": "nginx"}),
            logs: ProbeLogs::ok(),
        };
        let m1 = Metadata::new(MetadataType::Nip66Http, probe.to_metadata_value()).unwrap();
        let m2 = Metadata::new(MetadataType::Nip66Http, probe.to_metadata_value()).unwrap();
        assert_eq!(m1.content_hash(), m2.content_hash());
    }
}
