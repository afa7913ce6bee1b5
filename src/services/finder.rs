//! Finder service: discovers new relay URLs from stored events and from
//! public relay-list APIs, registering every validated hit as a
//! candidate for the validator.
//!
//! Event scanning is cursor-paginated per relay with a composite
//! `(seen_at, event_id)` cursor so that historical events back-filled
//! by the synchronizer are eventually visited exactly once. Candidate
//! upserts and the cursor advance commit in one transaction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{ApiSourceConfig, BaseServiceConfig, FinderConfig};
use crate::database::Database;
use crate::error::Result;
use crate::models::Relay;
use crate::models::service_state::ServiceName;
use crate::services::queries::{self, EventScanCursor};
use crate::services::{Service, Shutdown};

pub struct Finder {
    db: Arc<Database>,
    config: Arc<FinderConfig>,
    shutdown: Shutdown,
}

impl Finder {
    pub fn new(db: Arc<Database>, config: FinderConfig, shutdown: Shutdown) -> Self {
        Self {
            db,
            config: Arc::new(config),
            shutdown,
        }
    }

    // -----------------------------------------------------------------------
    // Discovery from stored events
    // -----------------------------------------------------------------------

    async fn find_from_events(&self) -> Result<u64> {
        if !self.config.events.enabled {
            return Ok(0);
        }

        match queries::delete_orphan_cursors(&self.db, ServiceName::Finder).await {
            Ok(0) => {}
            Ok(removed) => {
                tracing::info!(
                    target: "bigbrotr::services::finder",
                    count = removed,
                    "orphan_cursors_removed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    target: "bigbrotr::services::finder",
                    error = %e,
                    "orphan_cursor_cleanup_failed"
                );
            }
        }

        let relay_urls = match queries::get_all_relay_urls(&self.db).await {
            Ok(urls) => urls,
            Err(e) => {
                tracing::warn!(
                    target: "bigbrotr::services::finder",
                    error = %e,
                    "fetch_relays_failed"
                );
                return Ok(0);
            }
        };
        if relay_urls.is_empty() {
            tracing::debug!(target: "bigbrotr::services::finder", "no_relays_to_scan");
            return Ok(0);
        }

        let cursors = match queries::get_event_scan_cursors(&self.db).await {
            Ok(cursors) => cursors,
            Err(e) => {
                tracing::warn!(
                    target: "bigbrotr::services::finder",
                    error = %e,
                    "fetch_cursors_failed"
                );
                return Ok(0);
            }
        };

        tracing::debug!(
            target: "bigbrotr::services::finder",
            relay_count = relay_urls.len(),
            "events_scan_started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max_parallel_events));
        let mut tasks: JoinSet<(u64, u64, bool)> = JoinSet::new();
        for url in relay_urls {
            let db = self.db.clone();
            let config = self.config.clone();
            let shutdown = self.shutdown.clone();
            let semaphore = semaphore.clone();
            let cursor = cursors.get(&url).cloned();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (0, 0, false);
                };
                if !shutdown.is_running() {
                    return (0, 0, true);
                }
                match scan_relay_events(&db, &config, &shutdown, &url, cursor).await {
                    Ok((events, relays)) => (events, relays, true),
                    Err(e) => {
                        tracing::warn!(
                            target: "bigbrotr::services::finder",
                            relay = %url,
                            error = %e,
                            "relay_event_scan_failed"
                        );
                        (0, 0, false)
                    }
                }
            });
        }

        let mut events_scanned = 0u64;
        let mut relays_found = 0u64;
        let mut relays_processed = 0u64;
        let mut relays_failed = 0u64;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((events, relays, ok)) => {
                    events_scanned += events;
                    relays_found += relays;
                    if ok {
                        relays_processed += 1;
                    } else {
                        relays_failed += 1;
                    }
                }
                Err(e) => {
                    relays_failed += 1;
                    tracing::error!(
                        target: "bigbrotr::services::finder",
                        error = %e,
                        "event_scan_worker_failed"
                    );
                }
            }
        }

        self.set_gauge("events_scanned", events_scanned as f64);
        self.set_gauge("relays_found", relays_found as f64);
        self.set_gauge("relays_processed", relays_processed as f64);
        self.set_gauge("relays_failed", relays_failed as f64);
        self.inc_counter("total_events_scanned", events_scanned);
        self.inc_counter("total_relays_found", relays_found);

        tracing::info!(
            target: "bigbrotr::services::finder",
            scanned = events_scanned,
            relays_found,
            relays_processed,
            relays_failed,
            "events_completed"
        );
        Ok(relays_found)
    }

    // -----------------------------------------------------------------------
    // Discovery from external APIs
    // -----------------------------------------------------------------------

    async fn find_from_api(&self) -> Result<u64> {
        if !self.config.api.enabled {
            return Ok(0);
        }

        let mut discovered: HashMap<String, Relay> = HashMap::new();
        let enabled: Vec<&ApiSourceConfig> = self
            .config
            .api
            .sources
            .iter()
            .filter(|source| source.enabled)
            .collect();

        for (index, source) in enabled.iter().enumerate() {
            if !self.shutdown.is_running() {
                break;
            }
            match self.fetch_single_api(source).await {
                Ok(urls) => {
                    let mut validated = 0usize;
                    for url in &urls {
                        if let Ok(relay) = Relay::parse(url) {
                            validated += 1;
                            discovered.insert(relay.url.clone(), relay);
                        } else {
                            tracing::debug!(
                                target: "bigbrotr::services::finder",
                                url,
                                "invalid_relay_url"
                            );
                        }
                    }
                    tracing::debug!(
                        target: "bigbrotr::services::finder",
                        url = %source.url,
                        fetched = urls.len(),
                        validated,
                        "api_fetched"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target: "bigbrotr::services::finder",
                        url = %source.url,
                        error = %e,
                        "api_fetch_failed"
                    );
                }
            }

            let delay = self.config.api.delay_between_requests_s;
            if delay > 0.0
                && index < enabled.len() - 1
                && self
                    .shutdown
                    .wait_for(std::time::Duration::from_secs_f64(delay))
                    .await
            {
                break;
            }
        }

        let mut found = 0i64;
        if !discovered.is_empty() {
            let relays: Vec<Relay> = discovered.values().cloned().collect();
            match queries::upsert_candidates(&self.db, &relays).await {
                Ok(count) => found = count,
                Err(e) => {
                    tracing::error!(
                        target: "bigbrotr::services::finder",
                        error = %e,
                        count = relays.len(),
                        "upsert_candidates_failed"
                    );
                }
            }
        }

        self.set_gauge("api_relays", discovered.len() as f64);
        self.inc_counter("total_api_relays_found", discovered.len() as u64);

        tracing::info!(
            target: "bigbrotr::services::finder",
            found,
            fetched = discovered.len(),
            "apis_completed"
        );
        Ok(found as u64)
    }

    /// Fetch one API endpoint and extract URL strings through its
    /// JMESPath expression (default `[*]`: a flat array of strings).
    async fn fetch_single_api(&self, source: &ApiSourceConfig) -> Result<Vec<String>> {
        let timeout = std::time::Duration::from_secs_f64(source.timeout_s);
        let connect_timeout =
            std::time::Duration::from_secs_f64(source.connect_timeout_s.min(source.timeout_s));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .danger_accept_invalid_certs(!self.config.api.verify_ssl)
            .build()?;

        let response = client.get(&source.url).send().await?.error_for_status()?;

        let max_size = self.config.api.max_response_size;
        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > max_size {
                return Err(crate::error::BigBrotrError::Other(anyhow::anyhow!(
                    "response too large: > {max_size} bytes"
                )));
            }
            body.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&body).into_owned();

        let expression = jmespath::compile(&source.jmespath)
            .map_err(|e| crate::error::BigBrotrError::Configuration(e.to_string()))?;
        let data = jmespath::Variable::from_json(&body)
            .map_err(|e| crate::error::BigBrotrError::Other(anyhow::anyhow!(e)))?;
        let result = expression
            .search(data)
            .map_err(|e| crate::error::BigBrotrError::Other(anyhow::anyhow!(e)))?;

        Ok(extract_url_strings(&result))
    }
}

/// Pull URL strings from a JMESPath result: an array of strings (items
/// of other types are skipped) or a single string.
fn extract_url_strings(value: &jmespath::Variable) -> Vec<String> {
    match value {
        jmespath::Variable::Array(items) => items
            .iter()
            .filter_map(|item| item.as_string().cloned())
            .collect(),
        jmespath::Variable::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Scan one relay's stored events for embedded relay URLs, advancing
/// the composite cursor transactionally per page. Stops on a partial
/// page.
async fn scan_relay_events(
    db: &Database,
    config: &FinderConfig,
    shutdown: &Shutdown,
    relay_url: &str,
    mut cursor: Option<EventScanCursor>,
) -> Result<(u64, u64)> {
    let batch_size = config.events.batch_size;
    let mut events_scanned = 0u64;
    let mut relays_found = 0u64;

    while shutdown.is_running() {
        let page = queries::scan_event_page(db, relay_url, cursor.as_ref(), batch_size).await?;
        if page.is_empty() {
            break;
        }

        let mut discovered: HashMap<String, Relay> = HashMap::new();
        for event in &page {
            for url in queries::extract_relay_url_strings(event) {
                if let Ok(relay) = Relay::parse(&url) {
                    discovered.insert(relay.url.clone(), relay);
                }
            }
        }

        let last = page.last().expect("page is non-empty");
        let next_cursor = EventScanCursor {
            seen_at: last.seen_at,
            event_id: last.event_id.clone(),
        };

        let relays: Vec<Relay> = discovered.into_values().collect();
        // One transaction per page: candidates and cursor move together
        // unless the batch cap forces a split (candidates first, then
        // the cursor only advances after they are safe).
        let max_batch = db.config().batch.max_size.saturating_sub(1);
        if relays.len() > max_batch {
            queries::upsert_candidates(db, &relays).await?;
            queries::upsert_candidates_with_cursor(db, &[], relay_url, &next_cursor).await?;
        } else {
            queries::upsert_candidates_with_cursor(db, &relays, relay_url, &next_cursor).await?;
        }

        relays_found += relays.len() as u64;
        events_scanned += page.len() as u64;
        cursor = Some(next_cursor);

        if (page.len() as i64) < batch_size {
            break;
        }
    }

    Ok((events_scanned, relays_found))
}

#[async_trait]
impl Service for Finder {
    const NAME: ServiceName = ServiceName::Finder;

    fn base(&self) -> &BaseServiceConfig {
        &self.config.service
    }

    fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    async fn run(&mut self) -> Result<()> {
        tracing::info!(
            target: "bigbrotr::services::finder",
            events_enabled = self.config.events.enabled,
            api_enabled = self.config.api.enabled,
            "cycle_started"
        );
        let mut found = 0u64;
        found += self.find_from_events().await?;
        found += self.find_from_api().await?;
        tracing::info!(target: "bigbrotr::services::finder", found, "cycle_completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_url_strings_from_array() {
        let data =
            jmespath::Variable::from_json(r#"["wss://a.example.com", 42, "wss://b.example.com"]"#)
                .unwrap();
        assert_eq!(
            extract_url_strings(&data),
            vec!["wss://a.example.com", "wss://b.example.com"]
        );
    }

    #[test]
    fn test_extract_url_strings_from_scalar_and_object() {
        let s = jmespath::Variable::from_json(r#""wss://single.example.com""#).unwrap();
        assert_eq!(extract_url_strings(&s), vec!["wss://single.example.com"]);

        let o = jmespath::Variable::from_json(r#"{"not":"an array"}"#).unwrap();
        assert!(extract_url_strings(&o).is_empty());
    }

    #[test]
    fn test_jmespath_object_keys_expression() {
        // nostr.watch-style: relay URLs as object keys
        let expr = jmespath::compile("keys(@)").unwrap();
        let data = jmespath::Variable::from_json(
            r#"{"wss://a.example.com": {"online": true}, "wss://b.example.com": {}}"#,
        )
        .unwrap();
        let result = expr.search(data).unwrap();
        let mut urls = extract_url_strings(&result);
        urls.sort();
        assert_eq!(urls, vec!["wss://a.example.com", "wss://b.example.com"]);
    }

    #[test]
    fn test_jmespath_nested_path_expression() {
        let expr = jmespath::compile("data.relays[*].url").unwrap();
        let data = jmespath::Variable::from_json(
            r#"{"data":{"relays":[{"url":"wss://x.example.com"},{"url":"wss://y.example.com"}]}}"#,
        )
        .unwrap();
        let result = expr.search(data).unwrap();
        assert_eq!(
            extract_url_strings(&result),
            vec!["wss://x.example.com", "wss://y.example.com"]
        );
    }
}
