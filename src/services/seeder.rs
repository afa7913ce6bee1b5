//! Seeder service: one-shot bootstrap of the relay discovery pipeline
//! from a seed file.
//!
//! Reads one candidate URL per line (`#` comments and blank lines
//! ignored), validates each, and either registers them as validation
//! candidates (default) or writes relay rows directly when
//! `to_validate` is off.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::config::{BaseServiceConfig, SeederConfig};
use crate::database::Database;
use crate::error::Result;
use crate::models::Relay;
use crate::models::service_state::ServiceName;
use crate::services::{Service, Shutdown, queries};

pub struct Seeder {
    db: Arc<Database>,
    config: SeederConfig,
    shutdown: Shutdown,
}

impl Seeder {
    pub fn new(db: Arc<Database>, config: SeederConfig, shutdown: Shutdown) -> Self {
        Self {
            db,
            config,
            shutdown,
        }
    }

    async fn seed(&self) -> Result<()> {
        let path = Path::new(&self.config.seed.file_path);
        if !path.exists() {
            tracing::warn!(
                target: "bigbrotr::services::seeder",
                path = %path.display(),
                "file_not_found"
            );
            return Ok(());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let relays = parse_seed_file(&content);
        tracing::debug!(
            target: "bigbrotr::services::seeder",
            path = %path.display(),
            count = relays.len(),
            "file_parsed"
        );

        if relays.is_empty() {
            tracing::info!(target: "bigbrotr::services::seeder", "no_valid_relays");
            return Ok(());
        }

        if self.config.seed.to_validate {
            self.seed_as_candidates(&relays).await
        } else {
            self.seed_as_relays(&relays).await
        }
    }

    /// Default path: candidates in the state store, picked up by the
    /// validator before any relay row exists.
    async fn seed_as_candidates(&self, relays: &[Relay]) -> Result<()> {
        let count = queries::upsert_candidates(&self.db, relays).await?;
        self.inc_counter("total_candidates_inserted", count as u64);
        tracing::info!(
            target: "bigbrotr::services::seeder",
            count,
            "candidates_inserted"
        );
        Ok(())
    }

    /// Bypass path: straight into the relay table, skipping WebSocket
    /// validation. Duplicates are silently skipped.
    async fn seed_as_relays(&self, relays: &[Relay]) -> Result<()> {
        let batch_size = self.db.config().batch.max_size;
        let mut inserted = 0i64;

        for (index, batch) in relays.chunks(batch_size).enumerate() {
            let count = self.db.insert_relays(batch).await?;
            inserted += count;
            tracing::debug!(
                target: "bigbrotr::services::seeder",
                batch_num = index + 1,
                count,
                "batch_inserted"
            );
        }

        self.inc_counter("total_relays_inserted", inserted as u64);
        tracing::info!(
            target: "bigbrotr::services::seeder",
            total = relays.len(),
            inserted,
            "relays_inserted"
        );
        Ok(())
    }
}

#[async_trait]
impl Service for Seeder {
    const NAME: ServiceName = ServiceName::Seeder;

    fn base(&self) -> &BaseServiceConfig {
        &self.config.service
    }

    fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    async fn run(&mut self) -> Result<()> {
        tracing::info!(
            target: "bigbrotr::services::seeder",
            file = %self.config.seed.file_path,
            to_validate = self.config.seed.to_validate,
            "cycle_started"
        );
        let start = Instant::now();
        self.seed().await?;
        tracing::info!(
            target: "bigbrotr::services::seeder",
            duration_s = start.elapsed().as_secs_f64(),
            "cycle_completed"
        );
        Ok(())
    }
}

/// Parse a seed file: one URL per line, `#` comments and blank lines
/// skipped, invalid URLs dropped.
pub fn parse_seed_file(content: &str) -> Vec<Relay> {
    let mut relays = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match Relay::parse(line) {
            Ok(relay) => relays.push(relay),
            Err(e) => {
                tracing::debug!(
                    target: "bigbrotr::services::seeder",
                    url = line,
                    error = %e,
                    "invalid_seed_url"
                );
            }
        }
    }
    relays
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed_file_skips_comments_and_blanks() {
        let content = "\
# Bootstrap relays
wss://relay.damus.io

ws://relay.example.com
# trailing comment
wss://nos.lol
";
        let relays = parse_seed_file(content);
        let urls: Vec<&str> = relays.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "wss://relay.damus.io",
                "wss://relay.example.com",
                "wss://nos.lol"
            ]
        );
    }

    #[test]
    fn test_parse_seed_file_drops_invalid_lines() {
        let content = "\
wss://valid.example.com
not-a-url
wss://10.0.0.1
https://wrong-scheme.example.com
";
        let relays = parse_seed_file(content);
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].url, "wss://valid.example.com");
    }

    #[test]
    fn test_parse_seed_file_empty_input() {
        assert!(parse_seed_file("").is_empty());
        assert!(parse_seed_file("# only comments\n\n").is_empty());
    }
}
