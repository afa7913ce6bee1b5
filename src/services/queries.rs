//! Domain SQL shared by the services. Everything here goes through the
//! [`Database`] facade for timeouts and transient-error retry; services
//! never write inline SQL.

use std::collections::HashMap;

use serde_json::json;
use sqlx::Row;

use crate::database::Database;
use crate::error::Result;
use crate::models::relay::Relay;
use crate::models::service_state::{ServiceName, ServiceState, StateType};

// ---------------------------------------------------------------------------
// Relay queries
// ---------------------------------------------------------------------------

/// All relay URLs, ordered for deterministic scans.
pub async fn get_all_relay_urls(db: &Database) -> Result<Vec<String>> {
    let rows = db
        .with_retry("get_all_relay_urls", db.query_timeout(), |pg| {
            let query = sqlx::query_scalar::<_, String>("SELECT url FROM relay ORDER BY url");
            async move { query.fetch_all(&pg).await }
        })
        .await?;
    Ok(rows)
}

/// All relays with their discovery timestamps. Rows whose URL no longer
/// parses are skipped with a debug log rather than failing the cycle.
pub async fn get_all_relays(db: &Database) -> Result<Vec<Relay>> {
    let rows = db
        .with_retry("get_all_relays", db.query_timeout(), |pg| {
            let query = sqlx::query(
                "SELECT url, network, discovered_at FROM relay ORDER BY discovered_at ASC",
            );
            async move { query.fetch_all(&pg).await }
        })
        .await?;

    let mut relays = Vec::with_capacity(rows.len());
    for row in rows {
        let url: String = row.try_get("url")?;
        let discovered_at: i64 = row.try_get("discovered_at")?;
        match Relay::with_discovered_at(url.trim(), discovered_at) {
            Ok(relay) => relays.push(relay),
            Err(e) => {
                tracing::debug!(target: "bigbrotr::queries", url, error = %e, "invalid_relay_url");
            }
        }
    }
    Ok(relays)
}

// ---------------------------------------------------------------------------
// Candidate lifecycle (validator's state-store slice)
// ---------------------------------------------------------------------------

/// Register relays as validation candidates. Existing candidates get a
/// refreshed `inserted_at`; the upsert is idempotent.
pub async fn upsert_candidates(db: &Database, relays: &[Relay]) -> Result<i64> {
    let now = chrono::Utc::now().timestamp();
    let mut records = Vec::with_capacity(relays.len());
    for relay in relays {
        records.push(ServiceState::new(
            ServiceName::Validator,
            StateType::Candidate,
            relay.url.clone(),
            json!({
                "failed_attempts": 0,
                "network": relay.network.as_str(),
                "inserted_at": now,
            }),
            now,
        )?);
    }

    let mut upserted = 0;
    for chunk in records.chunks(db.config().batch.max_size) {
        upserted += db.upsert_service_state(chunk).await?;
    }
    Ok(upserted)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRow {
    pub url: String,
    pub network: String,
    pub failed_attempts: i64,
    pub inserted_at: i64,
}

/// Pending candidates for the given networks.
pub async fn count_candidates(db: &Database, networks: &[String]) -> Result<i64> {
    let count = db
        .with_retry("count_candidates", db.query_timeout(), |pg| {
            let query = sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COUNT(*)
                FROM service_state
                WHERE service_name = $1
                  AND state_type = $2
                  AND state_value->>'network' = ANY($3)
                "#,
            )
            .bind(ServiceName::Validator.as_str())
            .bind(StateType::Candidate.as_str())
            .bind(networks);
            async move { query.fetch_one(&pg).await }
        })
        .await?;
    Ok(count)
}

/// Next chunk of candidates: fewest failures first, oldest first, and
/// only rows untouched since the cycle started so each candidate is
/// tried at most once per cycle.
pub async fn fetch_candidate_chunk(
    db: &Database,
    networks: &[String],
    before_timestamp: i64,
    limit: i64,
) -> Result<Vec<CandidateRow>> {
    let rows = db
        .with_retry("fetch_candidate_chunk", db.query_timeout(), |pg| {
            let query = sqlx::query(
                r#"
                SELECT state_key,
                       state_value->>'network' AS network,
                       COALESCE((state_value->>'failed_attempts')::int, 0) AS failed_attempts,
                       COALESCE((state_value->>'inserted_at')::BIGINT, 0) AS inserted_at
                FROM service_state
                WHERE service_name = $1
                  AND state_type = $2
                  AND state_value->>'network' = ANY($3)
                  AND updated_at < $4
                ORDER BY COALESCE((state_value->>'failed_attempts')::int, 0) ASC,
                         updated_at ASC
                LIMIT $5
                "#,
            )
            .bind(ServiceName::Validator.as_str())
            .bind(StateType::Candidate.as_str())
            .bind(networks)
            .bind(before_timestamp)
            .bind(limit);
            async move { query.fetch_all(&pg).await }
        })
        .await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        candidates.push(CandidateRow {
            url: row.try_get("state_key")?,
            network: row
                .try_get::<Option<String>, _>("network")?
                .unwrap_or_default(),
            failed_attempts: i64::from(row.try_get::<i32, _>("failed_attempts")?),
            inserted_at: row.try_get("inserted_at")?,
        });
    }
    Ok(candidates)
}

/// Remove candidates whose URL already exists in the relay table.
pub async fn delete_stale_candidates(db: &Database) -> Result<u64> {
    let result = db
        .with_retry("delete_stale_candidates", db.cleanup_timeout(), |pg| {
            let query = sqlx::query(
                r#"
                DELETE FROM service_state
                WHERE service_name = $1
                  AND state_type = $2
                  AND EXISTS (SELECT 1 FROM relay r WHERE r.url = state_key)
                "#,
            )
            .bind(ServiceName::Validator.as_str())
            .bind(StateType::Candidate.as_str());
            async move { query.execute(&pg).await }
        })
        .await?;
    Ok(result.rows_affected())
}

/// Remove candidates that exhausted the failure budget.
pub async fn delete_exhausted_candidates(db: &Database, max_failures: i64) -> Result<u64> {
    let result = db
        .with_retry("delete_exhausted_candidates", db.cleanup_timeout(), |pg| {
            let query = sqlx::query(
                r#"
                DELETE FROM service_state
                WHERE service_name = $1
                  AND state_type = $2
                  AND COALESCE((state_value->>'failed_attempts')::int, 0) >= $3
                "#,
            )
            .bind(ServiceName::Validator.as_str())
            .bind(StateType::Candidate.as_str())
            .bind(max_failures);
            async move { query.execute(&pg).await }
        })
        .await?;
    Ok(result.rows_affected())
}

/// Atomically insert validated relays and delete their candidate rows.
/// Either both sides commit or neither does.
pub async fn promote_candidates(db: &Database, relays: &[Relay]) -> Result<i64> {
    if relays.is_empty() {
        return Ok(0);
    }

    let urls: Vec<String> = relays.iter().map(|r| r.url.clone()).collect();
    let networks: Vec<String> = relays.iter().map(|r| r.network.to_string()).collect();
    let discovered_ats: Vec<i64> = relays.iter().map(|r| r.discovered_at).collect();

    let mut tx = db.begin().await?;
    let inserted: Option<i32> = sqlx::query_scalar("SELECT relay_insert($1, $2, $3)")
        .bind(&urls)
        .bind(&networks)
        .bind(&discovered_ats)
        .fetch_one(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        DELETE FROM service_state
        WHERE service_name = $1
          AND state_type = $2
          AND state_key = ANY($3)
        "#,
    )
    .bind(ServiceName::Validator.as_str())
    .bind(StateType::Candidate.as_str())
    .bind(&urls)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(i64::from(inserted.unwrap_or(0)))
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Drop cursors whose relay no longer exists.
pub async fn delete_orphan_cursors(db: &Database, service: ServiceName) -> Result<u64> {
    let result = db
        .with_retry("delete_orphan_cursors", db.cleanup_timeout(), |pg| {
            let query = sqlx::query(
                r#"
                DELETE FROM service_state
                WHERE service_name = $1
                  AND state_type = $2
                  AND NOT EXISTS (SELECT 1 FROM relay r WHERE r.url = state_key)
                "#,
            )
            .bind(service.as_str())
            .bind(StateType::Cursor.as_str());
            async move { query.execute(&pg).await }
        })
        .await?;
    Ok(result.rows_affected())
}

/// All synchronizer cursors in one query: relay URL → `last_synced_at`.
pub async fn get_sync_cursors(db: &Database, service: ServiceName) -> Result<HashMap<String, i64>> {
    let rows = db
        .with_retry("get_sync_cursors", db.query_timeout(), |pg| {
            let query = sqlx::query(
                r#"
                SELECT state_key, (state_value->>'last_synced_at')::BIGINT AS cursor_value
                FROM service_state
                WHERE service_name = $1 AND state_type = $2
                "#,
            )
            .bind(service.as_str())
            .bind(StateType::Cursor.as_str());
            async move { query.fetch_all(&pg).await }
        })
        .await?;

    let mut cursors = HashMap::with_capacity(rows.len());
    for row in rows {
        let key: String = row.try_get("state_key")?;
        if let Some(value) = row.try_get::<Option<i64>, _>("cursor_value")? {
            cursors.insert(key, value);
        }
    }
    Ok(cursors)
}

/// Composite event-scan cursor: everything up to and including
/// `(seen_at, event_id)` has been visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventScanCursor {
    pub seen_at: i64,
    pub event_id: Vec<u8>,
}

/// All finder event-scan cursors in one query. Rows with missing or
/// malformed fields are skipped; their relay is rescanned from the
/// beginning, which is safe because candidate upserts are idempotent.
pub async fn get_event_scan_cursors(db: &Database) -> Result<HashMap<String, EventScanCursor>> {
    let rows = db
        .with_retry("get_event_scan_cursors", db.query_timeout(), |pg| {
            let query = sqlx::query(
                r#"
                SELECT state_key,
                       (state_value->>'seen_at')::BIGINT AS seen_at,
                       state_value->>'event_id' AS event_id
                FROM service_state
                WHERE service_name = $1 AND state_type = $2
                "#,
            )
            .bind(ServiceName::Finder.as_str())
            .bind(StateType::Cursor.as_str());
            async move { query.fetch_all(&pg).await }
        })
        .await?;

    let mut cursors = HashMap::with_capacity(rows.len());
    for row in rows {
        let key: String = row.try_get("state_key")?;
        let seen_at: Option<i64> = row.try_get("seen_at")?;
        let event_id_hex: Option<String> = row.try_get("event_id")?;
        match (seen_at, event_id_hex.as_deref().map(hex::decode)) {
            (Some(seen_at), Some(Ok(event_id))) => {
                cursors.insert(key, EventScanCursor { seen_at, event_id });
            }
            _ => {
                tracing::warn!(
                    target: "bigbrotr::queries",
                    relay = %key,
                    "invalid_cursor_data"
                );
            }
        }
    }
    Ok(cursors)
}

/// One page of stored events from a relay that may embed relay URLs,
/// paginated by the composite `(seen_at, event_id)` cursor with a
/// strict lexicographic `>` predicate.
#[derive(Debug, Clone)]
pub struct ScannedEvent {
    pub event_id: Vec<u8>,
    pub kind: i32,
    pub tags: serde_json::Value,
    pub content: String,
    pub seen_at: i64,
}

pub async fn scan_event_page(
    db: &Database,
    relay_url: &str,
    cursor: Option<&EventScanCursor>,
    limit: i64,
) -> Result<Vec<ScannedEvent>> {
    let (cursor_seen, cursor_event) = match cursor {
        Some(c) => (c.seen_at, c.event_id.clone()),
        None => (-1, Vec::new()),
    };

    let rows = db
        .with_retry("scan_event_page", db.query_timeout(), |pg| {
            let query = sqlx::query(
                r#"
                SELECT e.id, e.kind, e.tags, e.content, er.seen_at
                FROM event e
                INNER JOIN event_relay er ON e.id = er.event_id
                WHERE er.relay_url = $1
                  AND (er.seen_at > $2 OR (er.seen_at = $2 AND e.id > $3))
                  AND (e.kind IN (2, 3) OR e.tagvalues @> ARRAY['r'])
                ORDER BY er.seen_at ASC, e.id ASC
                LIMIT $4
                "#,
            )
            .bind(relay_url)
            .bind(cursor_seen)
            .bind(&cursor_event)
            .bind(limit);
            async move { query.fetch_all(&pg).await }
        })
        .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        events.push(ScannedEvent {
            event_id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            tags: row.try_get("tags")?,
            content: row.try_get("content")?,
            seen_at: row.try_get("seen_at")?,
        });
    }
    Ok(events)
}

/// Upsert discovered candidates and advance the scan cursor in one
/// transaction, so a crash never records progress past unpersisted
/// discoveries.
pub async fn upsert_candidates_with_cursor(
    db: &Database,
    relays: &[Relay],
    relay_url: &str,
    cursor: &EventScanCursor,
) -> Result<i64> {
    let now = chrono::Utc::now().timestamp();

    let mut names: Vec<String> = Vec::with_capacity(relays.len() + 1);
    let mut types: Vec<String> = Vec::with_capacity(relays.len() + 1);
    let mut keys: Vec<String> = Vec::with_capacity(relays.len() + 1);
    let mut values: Vec<crate::database::RawJson> = Vec::with_capacity(relays.len() + 1);
    let mut updated_ats: Vec<i64> = Vec::with_capacity(relays.len() + 1);

    for relay in relays {
        let state = ServiceState::new(
            ServiceName::Validator,
            StateType::Candidate,
            relay.url.clone(),
            json!({
                "failed_attempts": 0,
                "network": relay.network.as_str(),
                "inserted_at": now,
            }),
            now,
        )?;
        names.push(state.service_name.to_string());
        types.push(state.state_type.to_string());
        keys.push(state.state_key.clone());
        values.push(crate::database::raw_json(state.json_value())?);
        updated_ats.push(state.updated_at);
    }

    let cursor_state = ServiceState::new(
        ServiceName::Finder,
        StateType::Cursor,
        relay_url,
        json!({
            "seen_at": cursor.seen_at,
            "event_id": hex::encode(&cursor.event_id),
        }),
        now,
    )?;
    names.push(cursor_state.service_name.to_string());
    types.push(cursor_state.state_type.to_string());
    keys.push(cursor_state.state_key.clone());
    values.push(crate::database::raw_json(cursor_state.json_value())?);
    updated_ats.push(cursor_state.updated_at);

    let mut tx = db.begin().await?;
    sqlx::query("SELECT service_state_upsert($1, $2, $3, $4, $5)")
        .bind(&names)
        .bind(&types)
        .bind(&keys)
        .bind(&values)
        .bind(&updated_ats)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(relays.len() as i64)
}

// ---------------------------------------------------------------------------
// Monitor queries
// ---------------------------------------------------------------------------

/// Relays due for a health check, least-recently-checked first.
///
/// Due means the checkpoint is absent or older than `threshold`, and no
/// fresh monitoring marker exists (markers are written for failed
/// relays too, so a down relay is not re-dialed within the interval).
pub async fn fetch_relays_due_for_check(
    db: &Database,
    threshold: i64,
    networks: &[String],
) -> Result<Vec<Relay>> {
    let rows = db
        .with_retry("fetch_relays_due_for_check", db.query_timeout(), |pg| {
            let query = sqlx::query(
                r#"
                SELECT r.url, r.network, r.discovered_at
                FROM relay r
                LEFT JOIN service_state cp ON
                    cp.service_name = $1
                    AND cp.state_type = $2
                    AND cp.state_key = r.url
                WHERE r.network = ANY($3)
                  AND (cp.state_key IS NULL
                       OR COALESCE((cp.state_value->>'last_check_at')::BIGINT, 0) < $4)
                  AND NOT EXISTS (
                      SELECT 1 FROM service_state m
                      WHERE m.service_name = $1
                        AND m.state_type = $5
                        AND m.state_key = r.url
                        AND COALESCE((m.state_value->>'monitored_at')::BIGINT, 0) >= $4
                  )
                ORDER BY COALESCE((cp.state_value->>'last_check_at')::BIGINT, 0) ASC,
                         r.discovered_at ASC
                "#,
            )
            .bind(ServiceName::Monitor.as_str())
            .bind(StateType::Checkpoint.as_str())
            .bind(networks)
            .bind(threshold)
            .bind(StateType::Monitoring.as_str());
            async move { query.fetch_all(&pg).await }
        })
        .await?;

    let mut relays = Vec::with_capacity(rows.len());
    for row in rows {
        let url: String = row.try_get("url")?;
        let discovered_at: i64 = row.try_get("discovered_at")?;
        match Relay::with_discovered_at(url.trim(), discovered_at) {
            Ok(relay) => relays.push(relay),
            Err(e) => {
                tracing::debug!(target: "bigbrotr::queries", url, error = %e, "invalid_relay_url");
            }
        }
    }
    Ok(relays)
}

/// Drop monitoring markers older than `threshold` so the table only
/// carries the current interval's work.
pub async fn delete_stale_monitoring_markers(db: &Database, threshold: i64) -> Result<u64> {
    let result = db
        .with_retry("delete_stale_monitoring_markers", db.cleanup_timeout(), |pg| {
            let query = sqlx::query(
                r#"
                DELETE FROM service_state
                WHERE service_name = $1
                  AND state_type = $2
                  AND COALESCE((state_value->>'monitored_at')::BIGINT, 0) < $3
                "#,
            )
            .bind(ServiceName::Monitor.as_str())
            .bind(StateType::Monitoring.as_str())
            .bind(threshold);
            async move { query.execute(&pg).await }
        })
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// URL extraction from stored events (finder)
// ---------------------------------------------------------------------------

/// Pull relay URL strings out of one stored event: `r` tags on any
/// kind, the content of kind 2 (deprecated recommend-relay), and the
/// object keys of a kind 3 contact list.
pub fn extract_relay_url_strings(event: &ScannedEvent) -> Vec<String> {
    let mut urls = Vec::new();

    if let Some(tags) = event.tags.as_array() {
        for tag in tags {
            let Some(tag) = tag.as_array() else { continue };
            if tag.first().and_then(serde_json::Value::as_str) == Some("r") {
                if let Some(url) = tag.get(1).and_then(serde_json::Value::as_str) {
                    urls.push(url.trim().to_string());
                }
            }
        }
    }

    match event.kind {
        2 => {
            let content = event.content.trim();
            if !content.is_empty() {
                urls.push(content.to_string());
            }
        }
        3 => {
            if let Ok(serde_json::Value::Object(map)) =
                serde_json::from_str::<serde_json::Value>(&event.content)
            {
                urls.extend(map.keys().map(|k| k.trim().to_string()));
            }
        }
        _ => {}
    }

    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scanned(kind: i32, tags: serde_json::Value, content: &str) -> ScannedEvent {
        ScannedEvent {
            event_id: vec![0u8; 32],
            kind,
            tags,
            content: content.to_string(),
            seen_at: 0,
        }
    }

    #[test]
    fn test_extract_from_r_tags() {
        let event = scanned(
            1,
            json!([["r", "wss://relay.example.com"], ["p", "abcd"], ["r"]]),
            "",
        );
        assert_eq!(extract_relay_url_strings(&event), vec!["wss://relay.example.com"]);
    }

    #[test]
    fn test_extract_from_kind2_content() {
        let event = scanned(2, json!([]), " wss://recommended.example.com ");
        assert_eq!(
            extract_relay_url_strings(&event),
            vec!["wss://recommended.example.com"]
        );
        let empty = scanned(2, json!([]), "   ");
        assert!(extract_relay_url_strings(&empty).is_empty());
    }

    #[test]
    fn test_extract_from_kind3_contact_list() {
        let content = r#"{"wss://a.example.com":{"read":true},"wss://b.example.com":{}}"#;
        let event = scanned(3, json!([]), content);
        let mut urls = extract_relay_url_strings(&event);
        urls.sort();
        assert_eq!(urls, vec!["wss://a.example.com", "wss://b.example.com"]);
    }

    #[test]
    fn test_extract_combines_tags_and_content() {
        let event = scanned(
            3,
            json!([["r", "wss://tagged.example.com"]]),
            r#"{"wss://listed.example.com":{}}"#,
        );
        let urls = extract_relay_url_strings(&event);
        assert!(urls.contains(&"wss://tagged.example.com".to_string()));
        assert!(urls.contains(&"wss://listed.example.com".to_string()));
    }

    #[test]
    fn test_malformed_kind3_content_ignored() {
        let event = scanned(3, json!([]), "not json at all");
        assert!(extract_relay_url_strings(&event).is_empty());
    }
}
