//! Synchronizer service: pulls events from every known relay on an
//! incremental per-relay cursor.
//!
//! Each cycle shuffles the relay list (anti-herd), spawns one task per
//! relay under the per-network semaphores, and paginates forward
//! through the `[cursor+1, now − lookback]` window validating
//! signatures and window bounds before the cascade insert. Completed
//! relays enqueue their cursor update into a channel consumed by a
//! dedicated flusher task that bulk-upserts every
//! `cursor_flush_interval` updates and at cycle end, so a crash loses
//! at most one flush batch of progress.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use ::rand::seq::SliceRandom;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::{BaseServiceConfig, SyncFilterConfig, SynchronizerConfig};
use crate::database::Database;
use crate::error::{BigBrotrError, Result};
use crate::models::relay::Relay;
use crate::models::service_state::{ServiceName, ServiceState, StateType};
use crate::models::{Event, EventRelay};
use crate::services::queries;
use crate::services::{NetworkSemaphores, Service, Shutdown};
use crate::transport;

#[derive(Default)]
struct SyncCounters {
    synced_events: AtomicU64,
    invalid_events: AtomicU64,
    skipped_events: AtomicU64,
    synced_relays: AtomicU64,
    failed_relays: AtomicU64,
}

pub struct Synchronizer {
    db: Arc<Database>,
    config: Arc<SynchronizerConfig>,
    shutdown: Shutdown,
    keys: Keys,
}

impl Synchronizer {
    pub fn new(db: Arc<Database>, config: SynchronizerConfig, shutdown: Shutdown) -> Result<Self> {
        let keys = config.keys.load()?;
        Ok(Self {
            db,
            config: Arc::new(config),
            shutdown,
            keys,
        })
    }

    async fn fetch_relays(&self) -> Result<Vec<Relay>> {
        let mut relays = if self.config.source.from_database {
            queries::get_all_relays(&self.db).await?
        } else {
            Vec::new()
        };

        // Merge configured overrides that are not already present
        let known: HashSet<String> = relays.iter().map(|r| r.url.clone()).collect();
        for override_entry in &self.config.overrides {
            if known.contains(&override_entry.url) {
                continue;
            }
            match Relay::parse(&override_entry.url) {
                Ok(relay) => relays.push(relay),
                Err(e) => {
                    tracing::warn!(
                        target: "bigbrotr::services::synchronizer",
                        url = %override_entry.url,
                        error = %e,
                        "parse_override_relay_failed"
                    );
                }
            }
        }

        tracing::debug!(
            target: "bigbrotr::services::synchronizer",
            count = relays.len(),
            "relays_fetched"
        );
        Ok(relays)
    }

    async fn fetch_cursors(&self) -> Result<std::collections::HashMap<String, i64>> {
        if !self.config.time_range.use_relay_state {
            return Ok(std::collections::HashMap::new());
        }
        queries::get_sync_cursors(&self.db, ServiceName::Synchronizer).await
    }
}

/// `[start, end]` window for one relay, or `None` when there is
/// nothing to sync. Start is one past the cursor so the last synced
/// second is never refetched.
fn resolve_window(
    cursor: Option<i64>,
    use_relay_state: bool,
    default_start: i64,
    now: i64,
    lookback_seconds: i64,
) -> Option<(i64, i64)> {
    let start = if use_relay_state {
        cursor.map(|c| c + 1).unwrap_or(default_start)
    } else {
        default_start
    };
    let end = now - lookback_seconds;
    if start >= end {
        None
    } else {
        Some((start, end))
    }
}

fn single_letter(c: char) -> Option<SingleLetterTag> {
    let alphabet = match c.to_ascii_lowercase() {
        'a' => Alphabet::A,
        'b' => Alphabet::B,
        'c' => Alphabet::C,
        'd' => Alphabet::D,
        'e' => Alphabet::E,
        'f' => Alphabet::F,
        'g' => Alphabet::G,
        'h' => Alphabet::H,
        'i' => Alphabet::I,
        'j' => Alphabet::J,
        'k' => Alphabet::K,
        'l' => Alphabet::L,
        'm' => Alphabet::M,
        'n' => Alphabet::N,
        'o' => Alphabet::O,
        'p' => Alphabet::P,
        'q' => Alphabet::Q,
        'r' => Alphabet::R,
        's' => Alphabet::S,
        't' => Alphabet::T,
        'u' => Alphabet::U,
        'v' => Alphabet::V,
        'w' => Alphabet::W,
        'x' => Alphabet::X,
        'y' => Alphabet::Y,
        'z' => Alphabet::Z,
        _ => return None,
    };
    Some(if c.is_ascii_uppercase() {
        SingleLetterTag::uppercase(alphabet)
    } else {
        SingleLetterTag::lowercase(alphabet)
    })
}

/// Build the subscription filter for one page of the window.
fn build_filter(config: &SyncFilterConfig, since: i64, until: i64) -> Result<Filter> {
    let mut filter = Filter::new()
        .since(Timestamp::from(since.max(0) as u64))
        .until(Timestamp::from(until.max(0) as u64))
        .limit(config.limit);

    if let Some(kinds) = &config.kinds {
        filter = filter.kinds(kinds.iter().map(|k| Kind::from(*k)));
    }
    if let Some(ids) = &config.ids {
        let parsed: Vec<EventId> = ids
            .iter()
            .map(|id| EventId::from_hex(id))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| BigBrotrError::Configuration(e.to_string()))?;
        filter = filter.ids(parsed);
    }
    if let Some(authors) = &config.authors {
        let parsed: Vec<PublicKey> = authors
            .iter()
            .map(|pk| PublicKey::from_hex(pk))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| BigBrotrError::Configuration(e.to_string()))?;
        filter = filter.authors(parsed);
    }
    if let Some(tags) = &config.tags {
        for (letter, values) in tags {
            let Some(tag) = letter.chars().next().and_then(single_letter) else {
                continue;
            };
            filter = filter.custom_tags(tag, values.clone());
        }
    }
    Ok(filter)
}

struct PageStats {
    synced: u64,
    invalid: u64,
    skipped: u64,
}

/// Paginate one relay's window. Strictly sequential per relay: each
/// page advances `since` past the newest accepted `created_at`.
#[allow(clippy::too_many_arguments)]
async fn sync_relay_events(
    db: &Database,
    relay: &Relay,
    keys: &Keys,
    filter_config: &SyncFilterConfig,
    proxy_url: Option<&str>,
    request_timeout: Duration,
    shutdown: &Shutdown,
    mut start: i64,
    end: i64,
) -> Result<PageStats> {
    let mut stats = PageStats {
        synced: 0,
        invalid: 0,
        skipped: 0,
    };
    let limit = filter_config.limit;

    let mut session = transport::connect_ws(relay, proxy_url, request_timeout, true).await?;

    while shutdown.is_running() && start <= end {
        let filter = build_filter(filter_config, start, end)?;
        let fetched = transport::fetch_events(&mut session, &filter, Some(keys), request_timeout)
            .await?;
        stats.invalid += fetched.invalid;

        let batch_len = fetched.events.len();
        let seen_at = chrono::Utc::now().timestamp();
        let mut records: Vec<EventRelay> = Vec::with_capacity(batch_len);
        let mut max_created_at = start;

        for event in fetched.events {
            let created_at = event.created_at.as_u64() as i64;
            if created_at < start || created_at > end {
                stats.skipped += 1;
                continue;
            }
            if event.verify().is_err() {
                stats.invalid += 1;
                continue;
            }
            max_created_at = max_created_at.max(created_at);
            match Event::new(event) {
                Ok(event) => match EventRelay::new(event, relay.clone(), seen_at) {
                    Ok(record) => records.push(record),
                    Err(_) => stats.invalid += 1,
                },
                Err(_) => stats.invalid += 1,
            }
        }

        for chunk in records.chunks(db.config().batch.max_size) {
            let inserted = db.insert_event_relays(chunk, true).await?;
            stats.synced += inserted.max(0) as u64;
        }

        if batch_len < limit {
            break;
        }
        start = max_created_at + 1;
    }

    session.close().await;
    Ok(stats)
}

/// Consume cursor updates, bulk-upserting every `flush_interval`
/// entries and once more when the channel drains.
async fn run_cursor_flusher(
    db: Arc<Database>,
    mut receiver: mpsc::Receiver<ServiceState>,
    flush_interval: usize,
) {
    let mut buffer: Vec<ServiceState> = Vec::with_capacity(flush_interval);

    let flush = |db: Arc<Database>, batch: Vec<ServiceState>| async move {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = db.upsert_service_state(&batch).await {
            tracing::error!(
                target: "bigbrotr::services::synchronizer",
                error = %e,
                count = batch.len(),
                "cursor_batch_upsert_failed"
            );
        }
    };

    while let Some(state) = receiver.recv().await {
        buffer.push(state);
        if buffer.len() >= flush_interval {
            flush(db.clone(), std::mem::take(&mut buffer)).await;
        }
    }
    flush(db, buffer).await;
}

#[async_trait]
impl Service for Synchronizer {
    const NAME: ServiceName = ServiceName::Synchronizer;

    fn base(&self) -> &BaseServiceConfig {
        &self.config.service
    }

    fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    async fn run(&mut self) -> Result<()> {
        let semaphores = NetworkSemaphores::new(&self.config.networks);
        let cycle_start = std::time::Instant::now();

        let mut relays = self.fetch_relays().await?;
        relays.retain(|relay| self.config.networks.is_enabled(relay.network));
        if relays.is_empty() {
            tracing::info!(target: "bigbrotr::services::synchronizer", "no_relays_to_sync");
            return Ok(());
        }

        tracing::info!(
            target: "bigbrotr::services::synchronizer",
            relay_count = relays.len(),
            "sync_started"
        );
        relays.shuffle(&mut ::rand::rng());

        let cursors = self.fetch_cursors().await?;
        let counters = Arc::new(SyncCounters::default());

        let (cursor_tx, cursor_rx) = mpsc::channel::<ServiceState>(1024);
        let flusher = tokio::spawn(run_cursor_flusher(
            self.db.clone(),
            cursor_rx,
            self.config.concurrency.cursor_flush_interval,
        ));

        let now = chrono::Utc::now().timestamp();
        let mut tasks: JoinSet<()> = JoinSet::new();

        for relay in relays {
            let Some((start, end)) = resolve_window(
                cursors.get(&relay.url).copied(),
                self.config.time_range.use_relay_state,
                self.config.time_range.default_start,
                now,
                self.config.time_range.lookback_seconds,
            ) else {
                continue;
            };

            let db = self.db.clone();
            let config = self.config.clone();
            let keys = self.keys.clone();
            let shutdown = self.shutdown.clone();
            let counters = counters.clone();
            let cursor_tx = cursor_tx.clone();
            let semaphore = semaphores.get(relay.network);

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if !shutdown.is_running() {
                    return;
                }

                let relay_timeout = config.relay_timeout(&relay.url, relay.network);
                let request_timeout = config.request_timeout(&relay.url, relay.network);
                let proxy = config.networks.get(relay.network).resolve_proxy();

                let outcome = tokio::time::timeout(
                    relay_timeout,
                    sync_relay_events(
                        &db,
                        &relay,
                        &keys,
                        &config.filter,
                        proxy.as_deref(),
                        request_timeout,
                        &shutdown,
                        start,
                        end,
                    ),
                )
                .await;

                match outcome {
                    Ok(Ok(stats)) => {
                        counters.synced_events.fetch_add(stats.synced, Ordering::Relaxed);
                        counters.invalid_events.fetch_add(stats.invalid, Ordering::Relaxed);
                        counters.skipped_events.fetch_add(stats.skipped, Ordering::Relaxed);
                        counters.synced_relays.fetch_add(1, Ordering::Relaxed);

                        let cursor = ServiceState::new(
                            ServiceName::Synchronizer,
                            StateType::Cursor,
                            relay.url.clone(),
                            json!({"last_synced_at": end}),
                            chrono::Utc::now().timestamp(),
                        );
                        match cursor {
                            Ok(cursor) => {
                                let _ = cursor_tx.send(cursor).await;
                            }
                            Err(e) => {
                                tracing::error!(
                                    target: "bigbrotr::services::synchronizer",
                                    url = %relay.url,
                                    error = %e,
                                    "cursor_build_failed"
                                );
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        counters.failed_relays.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            target: "bigbrotr::services::synchronizer",
                            url = %relay.url,
                            error = %e,
                            "relay_sync_failed"
                        );
                    }
                    Err(_) => {
                        counters.failed_relays.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            target: "bigbrotr::services::synchronizer",
                            url = %relay.url,
                            timeout_s = relay_timeout.as_secs_f64(),
                            "relay_sync_timeout"
                        );
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                counters.failed_relays.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    target: "bigbrotr::services::synchronizer",
                    error = %e,
                    "worker_unexpected_exception"
                );
            }
        }

        // Closing the channel drains the flusher's remaining buffer
        drop(cursor_tx);
        if let Err(e) = flusher.await {
            tracing::error!(
                target: "bigbrotr::services::synchronizer",
                error = %e,
                "cursor_flusher_failed"
            );
        }

        let synced_events = counters.synced_events.load(Ordering::Relaxed);
        let invalid_events = counters.invalid_events.load(Ordering::Relaxed);
        let skipped_events = counters.skipped_events.load(Ordering::Relaxed);
        let synced_relays = counters.synced_relays.load(Ordering::Relaxed);
        let failed_relays = counters.failed_relays.load(Ordering::Relaxed);

        self.set_gauge("synced_relays", synced_relays as f64);
        self.set_gauge("failed_relays", failed_relays as f64);
        self.inc_counter("total_synced_events", synced_events);
        self.inc_counter("total_invalid_events", invalid_events);
        self.inc_counter("total_skipped_events", skipped_events);
        self.inc_counter("total_failed_relays", failed_relays);

        tracing::info!(
            target: "bigbrotr::services::synchronizer",
            synced_relays,
            failed_relays,
            synced_events,
            invalid_events,
            skipped_events,
            duration_s = cycle_start.elapsed().as_secs_f64(),
            "cycle_completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod window_tests {
        use super::*;

        #[test]
        fn test_cursor_advances_start_by_one() {
            let window = resolve_window(Some(1_000), true, 0, 100_000, 10_000);
            assert_eq!(window, Some((1_001, 90_000)));
        }

        #[test]
        fn test_missing_cursor_uses_default_start() {
            let window = resolve_window(None, true, 500, 100_000, 10_000);
            assert_eq!(window, Some((500, 90_000)));
        }

        #[test]
        fn test_relay_state_disabled_ignores_cursor() {
            let window = resolve_window(Some(99_999), false, 0, 100_000, 10_000);
            assert_eq!(window, Some((0, 90_000)));
        }

        #[test]
        fn test_exhausted_window_skipped() {
            assert_eq!(resolve_window(Some(95_000), true, 0, 100_000, 10_000), None);
            assert_eq!(resolve_window(Some(89_999), true, 0, 100_000, 10_000), None);
            assert_eq!(
                resolve_window(Some(89_998), true, 0, 100_000, 10_000),
                Some((89_999, 90_000))
            );
        }
    }

    mod filter_tests {
        use super::*;

        #[test]
        fn test_build_filter_window_bounds() {
            let config = SyncFilterConfig::default();
            let filter = build_filter(&config, 100, 200).unwrap();
            let rendered: serde_json::Value =
                serde_json::from_str(&filter.as_json()).unwrap();
            assert_eq!(rendered["since"], 100);
            assert_eq!(rendered["until"], 200);
            assert_eq!(rendered["limit"], 500);
        }

        #[test]
        fn test_build_filter_kinds_and_tags() {
            let mut tags = std::collections::HashMap::new();
            tags.insert("r".to_string(), vec!["wss://relay.example.com".to_string()]);
            let config = SyncFilterConfig {
                kinds: Some(vec![0, 1, 30166]),
                tags: Some(tags),
                ..SyncFilterConfig::default()
            };
            let filter = build_filter(&config, 0, 10).unwrap();
            let rendered: serde_json::Value =
                serde_json::from_str(&filter.as_json()).unwrap();
            assert_eq!(rendered["kinds"], serde_json::json!([0, 1, 30166]));
            assert_eq!(
                rendered["#r"],
                serde_json::json!(["wss://relay.example.com"])
            );
        }

        #[test]
        fn test_build_filter_rejects_bad_hex() {
            let config = SyncFilterConfig {
                ids: Some(vec!["nothex".to_string()]),
                ..SyncFilterConfig::default()
            };
            assert!(build_filter(&config, 0, 10).is_err());
        }

        #[test]
        fn test_single_letter_mapping() {
            assert_eq!(
                single_letter('r'),
                Some(SingleLetterTag::lowercase(Alphabet::R))
            );
            assert_eq!(
                single_letter('R'),
                Some(SingleLetterTag::uppercase(Alphabet::R))
            );
            assert_eq!(single_letter('1'), None);
        }
    }
}
