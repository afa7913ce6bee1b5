//! Validator service: promotes discovered candidates to relay rows by
//! probing each over WebSocket for Nostr protocol behavior.
//!
//! A candidate is valid iff, within the per-network timeout, a
//! WebSocket connects, a REQ is sent, and the relay answers with EOSE,
//! EVENT, NOTICE or AUTH before closing. Valid candidates are inserted
//! into the relay table and their candidate row deleted in one
//! transaction; invalid ones get `failed_attempts` incremented and are
//! retried in later cycles, fewest-failures first.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinSet;

use crate::config::{BaseServiceConfig, ValidatorConfig};
use crate::database::Database;
use crate::error::Result;
use crate::models::Relay;
use crate::models::relay::Network;
use crate::models::service_state::{ServiceName, ServiceState, StateType};
use crate::services::queries::{self, CandidateRow};
use crate::services::{ChunkProgress, NetworkSemaphores, Service, Shutdown};
use crate::transport;

pub struct Validator {
    db: Arc<Database>,
    config: Arc<ValidatorConfig>,
    shutdown: Shutdown,
    progress: ChunkProgress,
}

impl Validator {
    pub fn new(db: Arc<Database>, config: ValidatorConfig, shutdown: Shutdown) -> Self {
        Self {
            db,
            config: Arc::new(config),
            shutdown,
            progress: ChunkProgress::new(),
        }
    }

    async fn cleanup(&self) {
        match queries::delete_stale_candidates(&self.db).await {
            Ok(0) => {}
            Ok(removed) => {
                tracing::info!(
                    target: "bigbrotr::services::validator",
                    count = removed,
                    "stale_candidates_removed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    target: "bigbrotr::services::validator",
                    error = %e,
                    "stale_candidate_cleanup_failed"
                );
            }
        }

        if self.config.cleanup.enabled {
            match queries::delete_exhausted_candidates(&self.db, self.config.cleanup.max_failures)
                .await
            {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::info!(
                        target: "bigbrotr::services::validator",
                        count = removed,
                        max_failures = self.config.cleanup.max_failures,
                        "exhausted_candidates_removed"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target: "bigbrotr::services::validator",
                        error = %e,
                        "exhausted_candidate_cleanup_failed"
                    );
                }
            }
        }
    }

    /// Probe every candidate in the chunk concurrently, bounded by the
    /// per-network semaphores.
    async fn validate_chunk(
        &self,
        chunk: Vec<CandidateRow>,
        semaphores: &NetworkSemaphores,
    ) -> (Vec<Relay>, Vec<CandidateRow>) {
        let mut tasks: JoinSet<(CandidateRow, bool)> = JoinSet::new();

        for candidate in chunk {
            let Some(network) = Network::from_str_opt(&candidate.network) else {
                tracing::warn!(
                    target: "bigbrotr::services::validator",
                    url = %candidate.url,
                    network = %candidate.network,
                    "unknown_network"
                );
                continue;
            };
            let network_config = self.config.networks.get(network).clone();
            let semaphore = semaphores.get(network);
            let shutdown = self.shutdown.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (candidate, false);
                };
                if !shutdown.is_running() {
                    return (candidate, false);
                }

                let relay = match Relay::parse(&candidate.url) {
                    Ok(relay) => relay,
                    Err(e) => {
                        tracing::debug!(
                            target: "bigbrotr::services::validator",
                            url = %candidate.url,
                            error = %e,
                            "candidate_url_invalid"
                        );
                        return (candidate, false);
                    }
                };

                let proxy = network_config.resolve_proxy();
                let valid = match transport::probe_relay(
                    &relay,
                    proxy.as_deref(),
                    network_config.timeout(),
                )
                .await
                {
                    Ok(valid) => valid,
                    Err(e) => {
                        tracing::debug!(
                            target: "bigbrotr::services::validator",
                            url = %relay.url,
                            reason = %e,
                            "probe_failed"
                        );
                        false
                    }
                };
                (candidate, valid)
            });
        }

        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((candidate, true)) => match Relay::parse(&candidate.url) {
                    Ok(relay) => valid.push(relay),
                    Err(_) => invalid.push(candidate),
                },
                Ok((candidate, false)) => invalid.push(candidate),
                Err(e) => {
                    tracing::error!(
                        target: "bigbrotr::services::validator",
                        error = %e,
                        "validation_worker_failed"
                    );
                }
            }
        }
        (valid, invalid)
    }

    /// Re-upsert failed candidates with an incremented failure counter
    /// and refreshed `updated_at`, keeping them out of this cycle.
    async fn mark_failed(&self, candidates: &[CandidateRow]) -> Result<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut records = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            records.push(ServiceState::new(
                ServiceName::Validator,
                StateType::Candidate,
                candidate.url.clone(),
                json!({
                    "failed_attempts": candidate.failed_attempts + 1,
                    "network": candidate.network,
                    "inserted_at": candidate.inserted_at,
                }),
                now,
            )?);
        }
        for chunk in records.chunks(self.db.config().batch.max_size) {
            self.db.upsert_service_state(chunk).await?;
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
impl Service for Validator {
    const NAME: ServiceName = ServiceName::Validator;

    fn base(&self) -> &BaseServiceConfig {
        &self.config.service
    }

    fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    async fn run(&mut self) -> Result<()> {
        let semaphores = NetworkSemaphores::new(&self.config.networks);
        let cycle_start = chrono::Utc::now().timestamp();
        self.progress.reset();

        self.cleanup().await;

        let networks: Vec<String> = self
            .config
            .networks
            .enabled_networks()
            .into_iter()
            .map(|n| n.as_str().to_string())
            .collect();
        if networks.is_empty() {
            tracing::warn!(target: "bigbrotr::services::validator", "no_networks_enabled");
            return Ok(());
        }

        let total = queries::count_candidates(&self.db, &networks).await?;
        let cap = match self.config.processing.max_candidates {
            Some(max) => total.min(max),
            None => total,
        };
        self.progress.total = cap.max(0) as usize;
        self.emit_progress_gauges();

        tracing::info!(
            target: "bigbrotr::services::validator",
            total,
            cap,
            networks = ?networks,
            "cycle_started"
        );

        while self.shutdown.is_running() && (self.progress.processed as i64) < cap {
            let remaining = cap - self.progress.processed as i64;
            let limit = remaining.min(self.config.processing.chunk_size);
            let chunk = queries::fetch_candidate_chunk(&self.db, &networks, cycle_start, limit)
                .await?;
            if chunk.is_empty() {
                break;
            }

            let (valid, invalid) = self.validate_chunk(chunk, &semaphores).await;

            let promoted = match queries::promote_candidates(&self.db, &valid).await {
                Ok(promoted) => promoted,
                Err(e) => {
                    tracing::error!(
                        target: "bigbrotr::services::validator",
                        error = %e,
                        count = valid.len(),
                        "promote_candidates_failed"
                    );
                    0
                }
            };
            if let Err(e) = self.mark_failed(&invalid).await {
                tracing::error!(
                    target: "bigbrotr::services::validator",
                    error = %e,
                    count = invalid.len(),
                    "mark_failed_error"
                );
            }

            self.progress.record(valid.len(), invalid.len());
            self.inc_counter("total_promoted", promoted.max(0) as u64);
            self.inc_counter("total_failed", invalid.len() as u64);
            self.emit_progress_gauges();

            tracing::info!(
                target: "bigbrotr::services::validator",
                chunk = self.progress.chunks,
                promoted,
                failed = invalid.len(),
                remaining = self.progress.remaining(),
                "chunk_completed"
            );
        }

        tracing::info!(
            target: "bigbrotr::services::validator",
            processed = self.progress.processed,
            promoted = self.progress.succeeded,
            failed = self.progress.failed,
            duration_s = self.progress.elapsed_secs(),
            "cycle_completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing_for_candidates() {
        assert_eq!(Network::from_str_opt("clearnet"), Some(Network::Clearnet));
        assert_eq!(Network::from_str_opt("tor"), Some(Network::Tor));
        assert_eq!(Network::from_str_opt("bogus"), None);
    }

    #[test]
    fn test_failed_candidate_state_shape() {
        let candidate = CandidateRow {
            url: "wss://relay.example.com".to_string(),
            network: "clearnet".to_string(),
            failed_attempts: 2,
            inserted_at: 1_700_000_000,
        };
        let state = ServiceState::new(
            ServiceName::Validator,
            StateType::Candidate,
            candidate.url.clone(),
            json!({
                "failed_attempts": candidate.failed_attempts + 1,
                "network": candidate.network,
                "inserted_at": candidate.inserted_at,
            }),
            1_700_000_100,
        )
        .unwrap();
        assert_eq!(state.value_i64("failed_attempts"), Some(3));
        assert_eq!(state.value_str("network"), Some("clearnet"));
        assert_eq!(state.value_i64("inserted_at"), Some(1_700_000_000));
    }
}
