//! High-level database facade built on stored procedures.
//!
//! Sole contact point between services and PostgreSQL. Bulk inserts
//! transpose validated model rows into parallel column arrays and call
//! a stored procedure once per batch; procedure names are validated
//! against a strict identifier pattern before being interpolated.
//!
//! Two JSONB parameter shapes exist: values the models pre-rendered as
//! canonical JSON pass through verbatim ([`RawJson`]), everything else
//! is encoded once by the driver.

pub mod pool;

use std::future::Future;
use std::time::Duration;

use serde_json::value::RawValue;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::types::Json;
use sqlx::{Row, Transaction};

use crate::config::DatabaseConfig;
use crate::error::{BigBrotrError, Result};
use crate::models::service_state::{ServiceName, ServiceState, StateType};
use crate::models::{Event, EventRelay, Metadata, Relay, RelayMetadata};

pub use pool::Pool;

/// Pre-serialized JSON passed through to a JSONB column unchanged.
pub type RawJson = Json<Box<RawValue>>;

/// Wrap an already-canonical JSON string for verbatim JSONB binding.
pub fn raw_json(json: &str) -> Result<RawJson> {
    Ok(Json(RawValue::from_string(json.to_string())?))
}

/// Strict SQL identifier check applied to every stored-procedure name
/// before interpolation: `^[a-z_][a-z0-9_]*$`.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Build `SELECT name($1, …, $n)` for a validated procedure name.
pub fn procedure_sql(name: &str, arg_count: usize) -> Result<String> {
    if !is_valid_identifier(name) {
        return Err(BigBrotrError::InvalidIdentifier(name.to_string()));
    }
    let params: Vec<String> = (1..=arg_count).map(|i| format!("${i}")).collect();
    Ok(format!("SELECT {name}({})", params.join(", ")))
}

/// Parallel column arrays must all carry one entry per row.
fn validate_parallel_arrays(lens: &[usize]) -> Result<()> {
    let Some(&expected) = lens.first() else {
        return Ok(());
    };
    for (i, &len) in lens.iter().enumerate() {
        if len != expected {
            return Err(BigBrotrError::RaggedRows {
                row: i,
                got: len,
                expected,
            });
        }
    }
    Ok(())
}

pub struct Database {
    pool: Pool,
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            pool: Pool::new(config),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        self.pool.config()
    }

    pub async fn connect(&self) -> Result<()> {
        self.pool.connect().await
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    /// Handle to the raw pool for the domain query layer.
    pub async fn pg(&self) -> Result<PgPool> {
        self.pool.get().await
    }

    /// Begin a transaction; commits on `commit()`, rolls back on drop.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pg().await?.begin().await?)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.config().timeouts.query()
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.config().timeouts.batch()
    }

    pub fn cleanup_timeout(&self) -> Option<Duration> {
        self.config().timeouts.cleanup()
    }

    /// Run a query closure with per-query timeout and retry on transient
    /// connection errors. Each retry builds a fresh future and acquires a
    /// fresh connection from the pool, so a broken socket is never
    /// reused. Server-reported errors propagate on the first attempt.
    pub async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        timeout: Option<Duration>,
        make: F,
    ) -> Result<T>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let max_attempts = self.config().retry.max_attempts;
        let mut attempt = 0;
        loop {
            let pg = self.pg().await?;
            let fut = make(pg);
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => return Err(BigBrotrError::Timeout(operation.to_string())),
                },
                None => fut.await,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if pool::is_transient(&e) && attempt + 1 < max_attempts => {
                    let delay = self.config().retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        target: "bigbrotr::database",
                        operation,
                        attempt = attempt + 1,
                        delay_s = delay.as_secs_f64(),
                        error = %e,
                        "query_retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if pool::is_transient(&e) {
                        tracing::error!(
                            target: "bigbrotr::database",
                            operation,
                            attempts = attempt + 1,
                            error = %e,
                            "query_failed"
                        );
                        return Err(BigBrotrError::Connection(format!(
                            "{operation} failed after {} attempts: {e}",
                            attempt + 1
                        )));
                    }
                    return Err(BigBrotrError::Sqlx(e));
                }
            }
        }
    }

    fn validate_batch_size(&self, len: usize, operation: &'static str) -> Result<()> {
        let max = self.config().batch.max_size;
        if len > max {
            return Err(BigBrotrError::BatchTooLarge {
                operation,
                got: len,
                max,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Typed bulk inserts
    // -----------------------------------------------------------------------

    /// Bulk-insert relay rows. Duplicates are skipped server-side.
    pub async fn insert_relays(&self, records: &[Relay]) -> Result<i64> {
        if records.is_empty() {
            return Ok(0);
        }
        self.validate_batch_size(records.len(), "insert_relays")?;

        let urls: Vec<String> = records.iter().map(|r| r.url.clone()).collect();
        let networks: Vec<String> = records.iter().map(|r| r.network.to_string()).collect();
        let discovered_ats: Vec<i64> = records.iter().map(|r| r.discovered_at).collect();
        validate_parallel_arrays(&[urls.len(), networks.len(), discovered_ats.len()])?;

        let sql = procedure_sql("relay_insert", 3)?;
        let inserted: Option<i32> = self
            .with_retry("relay_insert", self.batch_timeout(), |pg| {
                let query = sqlx::query_scalar(&sql)
                    .bind(&urls)
                    .bind(&networks)
                    .bind(&discovered_ats);
                async move { query.fetch_one(&pg).await }
            })
            .await?;

        let inserted = i64::from(inserted.unwrap_or(0));
        tracing::debug!(
            target: "bigbrotr::database",
            count = inserted,
            attempted = records.len(),
            "relay_inserted"
        );
        Ok(inserted)
    }

    /// Bulk-insert event rows only; relay associations are a separate
    /// concern (see [`Database::insert_event_relays`]).
    pub async fn insert_events(&self, records: &[Event]) -> Result<i64> {
        if records.is_empty() {
            return Ok(0);
        }
        self.validate_batch_size(records.len(), "insert_events")?;

        let mut ids = Vec::with_capacity(records.len());
        let mut pubkeys = Vec::with_capacity(records.len());
        let mut created_ats = Vec::with_capacity(records.len());
        let mut kinds = Vec::with_capacity(records.len());
        let mut tags = Vec::with_capacity(records.len());
        let mut contents = Vec::with_capacity(records.len());
        let mut sigs = Vec::with_capacity(records.len());
        for event in records {
            let p = event.db_params();
            ids.push(p.id.clone());
            pubkeys.push(p.pubkey.clone());
            created_ats.push(p.created_at);
            kinds.push(p.kind);
            tags.push(raw_json(&p.tags)?);
            contents.push(p.content.clone());
            sigs.push(p.sig.clone());
        }

        let sql = procedure_sql("event_insert", 7)?;
        let inserted: Option<i32> = self
            .with_retry("event_insert", self.batch_timeout(), |pg| {
                let query = sqlx::query_scalar(&sql)
                    .bind(&ids)
                    .bind(&pubkeys)
                    .bind(&created_ats)
                    .bind(&kinds)
                    .bind(&tags)
                    .bind(&contents)
                    .bind(&sigs);
                async move { query.fetch_one(&pg).await }
            })
            .await?;

        let inserted = i64::from(inserted.unwrap_or(0));
        tracing::debug!(
            target: "bigbrotr::database",
            count = inserted,
            attempted = records.len(),
            "event_inserted"
        );
        Ok(inserted)
    }

    /// Bulk-insert event-relay junction rows.
    ///
    /// With `cascade`, the parent relay and event rows are created
    /// atomically when absent (relays → events → junctions in one
    /// procedure). Without it, only junction rows are written and the
    /// caller guarantees the foreign keys exist.
    pub async fn insert_event_relays(&self, records: &[EventRelay], cascade: bool) -> Result<i64> {
        if records.is_empty() {
            return Ok(0);
        }
        self.validate_batch_size(records.len(), "insert_event_relays")?;

        let inserted: Option<i32> = if cascade {
            let mut event_ids = Vec::with_capacity(records.len());
            let mut pubkeys = Vec::with_capacity(records.len());
            let mut created_ats = Vec::with_capacity(records.len());
            let mut kinds = Vec::with_capacity(records.len());
            let mut tags = Vec::with_capacity(records.len());
            let mut contents = Vec::with_capacity(records.len());
            let mut sigs = Vec::with_capacity(records.len());
            let mut relay_urls = Vec::with_capacity(records.len());
            let mut relay_networks = Vec::with_capacity(records.len());
            let mut relay_discovered_ats = Vec::with_capacity(records.len());
            let mut seen_ats = Vec::with_capacity(records.len());
            for er in records {
                let p = er.event.db_params();
                event_ids.push(p.id.clone());
                pubkeys.push(p.pubkey.clone());
                created_ats.push(p.created_at);
                kinds.push(p.kind);
                tags.push(raw_json(&p.tags)?);
                contents.push(p.content.clone());
                sigs.push(p.sig.clone());
                relay_urls.push(er.relay.url.clone());
                relay_networks.push(er.relay.network.to_string());
                relay_discovered_ats.push(er.relay.discovered_at);
                seen_ats.push(er.seen_at);
            }

            let sql = procedure_sql("event_relay_insert_cascade", 11)?;
            self.with_retry("event_relay_insert_cascade", self.batch_timeout(), |pg| {
                let query = sqlx::query_scalar(&sql)
                    .bind(&event_ids)
                    .bind(&pubkeys)
                    .bind(&created_ats)
                    .bind(&kinds)
                    .bind(&tags)
                    .bind(&contents)
                    .bind(&sigs)
                    .bind(&relay_urls)
                    .bind(&relay_networks)
                    .bind(&relay_discovered_ats)
                    .bind(&seen_ats);
                async move { query.fetch_one(&pg).await }
            })
            .await?
        } else {
            let event_ids: Vec<Vec<u8>> = records
                .iter()
                .map(|er| er.event.db_params().id.clone())
                .collect();
            let relay_urls: Vec<String> =
                records.iter().map(|er| er.relay.url.clone()).collect();
            let seen_ats: Vec<i64> = records.iter().map(|er| er.seen_at).collect();

            let sql = procedure_sql("event_relay_insert", 3)?;
            self.with_retry("event_relay_insert", self.batch_timeout(), |pg| {
                let query = sqlx::query_scalar(&sql)
                    .bind(&event_ids)
                    .bind(&relay_urls)
                    .bind(&seen_ats);
                async move { query.fetch_one(&pg).await }
            })
            .await?
        };

        let inserted = i64::from(inserted.unwrap_or(0));
        tracing::debug!(
            target: "bigbrotr::database",
            count = inserted,
            attempted = records.len(),
            cascade,
            "event_relay_inserted"
        );
        Ok(inserted)
    }

    /// Bulk-insert content-addressed metadata rows. Identical values
    /// under the same type deduplicate on `(id, metadata_type)`.
    pub async fn insert_metadata(&self, records: &[Metadata]) -> Result<i64> {
        if records.is_empty() {
            return Ok(0);
        }
        self.validate_batch_size(records.len(), "insert_metadata")?;

        let mut ids = Vec::with_capacity(records.len());
        let mut types = Vec::with_capacity(records.len());
        let mut payloads = Vec::with_capacity(records.len());
        for m in records {
            ids.push(m.content_hash().to_vec());
            types.push(m.metadata_type().to_string());
            payloads.push(raw_json(m.canonical_json())?);
        }

        let sql = procedure_sql("metadata_insert", 3)?;
        let inserted: Option<i32> = self
            .with_retry("metadata_insert", self.batch_timeout(), |pg| {
                let query = sqlx::query_scalar(&sql)
                    .bind(&ids)
                    .bind(&types)
                    .bind(&payloads);
                async move { query.fetch_one(&pg).await }
            })
            .await?;

        let inserted = i64::from(inserted.unwrap_or(0));
        tracing::debug!(
            target: "bigbrotr::database",
            count = inserted,
            attempted = records.len(),
            "metadata_inserted"
        );
        Ok(inserted)
    }

    /// Bulk-insert relay-metadata junction rows, optionally cascading
    /// creation of the parent relay and metadata rows.
    pub async fn insert_relay_metadata(
        &self,
        records: &[RelayMetadata],
        cascade: bool,
    ) -> Result<i64> {
        if records.is_empty() {
            return Ok(0);
        }
        self.validate_batch_size(records.len(), "insert_relay_metadata")?;

        let inserted: Option<i32> = if cascade {
            let mut relay_urls = Vec::with_capacity(records.len());
            let mut relay_networks = Vec::with_capacity(records.len());
            let mut relay_discovered_ats = Vec::with_capacity(records.len());
            let mut metadata_ids = Vec::with_capacity(records.len());
            let mut metadata_payloads = Vec::with_capacity(records.len());
            let mut metadata_types = Vec::with_capacity(records.len());
            let mut generated_ats = Vec::with_capacity(records.len());
            for rm in records {
                relay_urls.push(rm.relay.url.clone());
                relay_networks.push(rm.relay.network.to_string());
                relay_discovered_ats.push(rm.relay.discovered_at);
                metadata_ids.push(rm.metadata.content_hash().to_vec());
                metadata_payloads.push(raw_json(rm.metadata.canonical_json())?);
                metadata_types.push(rm.metadata.metadata_type().to_string());
                generated_ats.push(rm.generated_at);
            }

            let sql = procedure_sql("relay_metadata_insert_cascade", 7)?;
            self.with_retry(
                "relay_metadata_insert_cascade",
                self.batch_timeout(),
                |pg| {
                    let query = sqlx::query_scalar(&sql)
                        .bind(&relay_urls)
                        .bind(&relay_networks)
                        .bind(&relay_discovered_ats)
                        .bind(&metadata_ids)
                        .bind(&metadata_payloads)
                        .bind(&metadata_types)
                        .bind(&generated_ats);
                    async move { query.fetch_one(&pg).await }
                },
            )
            .await?
        } else {
            let relay_urls: Vec<String> =
                records.iter().map(|rm| rm.relay.url.clone()).collect();
            let metadata_ids: Vec<Vec<u8>> = records
                .iter()
                .map(|rm| rm.metadata.content_hash().to_vec())
                .collect();
            let metadata_types: Vec<String> = records
                .iter()
                .map(|rm| rm.metadata.metadata_type().to_string())
                .collect();
            let generated_ats: Vec<i64> = records.iter().map(|rm| rm.generated_at).collect();

            let sql = procedure_sql("relay_metadata_insert", 4)?;
            self.with_retry("relay_metadata_insert", self.batch_timeout(), |pg| {
                let query = sqlx::query_scalar(&sql)
                    .bind(&relay_urls)
                    .bind(&metadata_ids)
                    .bind(&metadata_types)
                    .bind(&generated_ats);
                async move { query.fetch_one(&pg).await }
            })
            .await?
        };

        let inserted = i64::from(inserted.unwrap_or(0));
        tracing::debug!(
            target: "bigbrotr::database",
            count = inserted,
            attempted = records.len(),
            cascade,
            "relay_metadata_inserted"
        );
        Ok(inserted)
    }

    // -----------------------------------------------------------------------
    // Service state
    // -----------------------------------------------------------------------

    /// Atomically upsert service state rows.
    ///
    /// The `service_state_upsert` procedure returns VOID; the attempted
    /// record count is reported instead.
    pub async fn upsert_service_state(&self, records: &[ServiceState]) -> Result<i64> {
        if records.is_empty() {
            return Ok(0);
        }
        self.validate_batch_size(records.len(), "upsert_service_state")?;

        let mut names = Vec::with_capacity(records.len());
        let mut types = Vec::with_capacity(records.len());
        let mut keys = Vec::with_capacity(records.len());
        let mut values = Vec::with_capacity(records.len());
        let mut updated_ats = Vec::with_capacity(records.len());
        for s in records {
            names.push(s.service_name.to_string());
            types.push(s.state_type.to_string());
            keys.push(s.state_key.clone());
            values.push(raw_json(s.json_value())?);
            updated_ats.push(s.updated_at);
        }

        let sql = procedure_sql("service_state_upsert", 5)?;
        self.with_retry("service_state_upsert", self.batch_timeout(), |pg| {
            let query = sqlx::query(&sql)
                .bind(&names)
                .bind(&types)
                .bind(&keys)
                .bind(&values)
                .bind(&updated_ats);
            async move { query.execute(&pg).await }
        })
        .await?;

        tracing::debug!(
            target: "bigbrotr::database",
            count = records.len(),
            "service_state_upserted"
        );
        Ok(records.len() as i64)
    }

    /// Retrieve persisted state rows for one service/type, optionally
    /// narrowed to a single key.
    pub async fn get_service_state(
        &self,
        service_name: ServiceName,
        state_type: StateType,
        key: Option<&str>,
    ) -> Result<Vec<ServiceState>> {
        let rows = self
            .with_retry("service_state_get", self.query_timeout(), |pg| {
                let query = sqlx::query("SELECT * FROM service_state_get($1, $2, $3)")
                    .bind(service_name.as_str())
                    .bind(state_type.as_str())
                    .bind(key);
                async move { query.fetch_all(&pg).await }
            })
            .await?;

        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            let state_key: String = row.try_get("state_key")?;
            let state_value: serde_json::Value = row.try_get("state_value")?;
            let updated_at: i64 = row.try_get("updated_at")?;
            states.push(ServiceState::new(
                service_name,
                state_type,
                state_key,
                state_value,
                updated_at,
            )?);
        }
        Ok(states)
    }

    /// Atomically delete state rows identified by three parallel arrays.
    pub async fn delete_service_state(
        &self,
        service_names: &[ServiceName],
        state_types: &[StateType],
        state_keys: &[String],
    ) -> Result<i64> {
        if service_names.is_empty() {
            return Ok(0);
        }
        validate_parallel_arrays(&[service_names.len(), state_types.len(), state_keys.len()])?;
        self.validate_batch_size(service_names.len(), "delete_service_state")?;

        let names: Vec<String> = service_names.iter().map(|n| n.to_string()).collect();
        let types: Vec<String> = state_types.iter().map(|t| t.to_string()).collect();

        let sql = procedure_sql("service_state_delete", 3)?;
        let deleted: Option<i32> = self
            .with_retry("service_state_delete", self.batch_timeout(), |pg| {
                let query = sqlx::query_scalar(&sql)
                    .bind(&names)
                    .bind(&types)
                    .bind(state_keys);
                async move { query.fetch_one(&pg).await }
            })
            .await?;

        let deleted = i64::from(deleted.unwrap_or(0));
        tracing::debug!(
            target: "bigbrotr::database",
            count = deleted,
            attempted = service_names.len(),
            "service_state_deleted"
        );
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Delete events with no relay association left.
    pub async fn delete_orphan_events(&self) -> Result<i64> {
        let sql = procedure_sql("orphan_event_delete", 0)?;
        let deleted: Option<i32> = self
            .with_retry("orphan_event_delete", self.cleanup_timeout(), |pg| {
                let query = sqlx::query_scalar(&sql);
                async move { query.fetch_one(&pg).await }
            })
            .await?;
        Ok(i64::from(deleted.unwrap_or(0)))
    }

    /// Delete metadata blobs with no relay association left.
    pub async fn delete_orphan_metadata(&self) -> Result<i64> {
        let sql = procedure_sql("orphan_metadata_delete", 0)?;
        let deleted: Option<i32> = self
            .with_retry("orphan_metadata_delete", self.cleanup_timeout(), |pg| {
                let query = sqlx::query_scalar(&sql);
                async move { query.fetch_one(&pg).await }
            })
            .await?;
        Ok(i64::from(deleted.unwrap_or(0)))
    }

    /// Refresh a materialized view through its `{view}_refresh`
    /// procedure. The caller-supplied view name passes through the same
    /// identifier validation as every other procedure.
    pub async fn refresh_materialized_view(&self, view_name: &str) -> Result<()> {
        let sql = procedure_sql(&format!("{view_name}_refresh"), 0)?;
        let timeout = self.config().timeouts.refresh();
        self.with_retry("matview_refresh", timeout, |pg| {
            let query = sqlx::query(&sql);
            async move { query.execute(&pg).await }
        })
        .await?;
        tracing::debug!(target: "bigbrotr::database", view = view_name, "matview_refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod identifier_tests {
        use super::*;

        #[test]
        fn test_valid_identifiers() {
            for name in [
                "relay_insert",
                "event_relay_insert_cascade",
                "_private",
                "a",
                "view2_refresh",
            ] {
                assert!(is_valid_identifier(name), "{name}");
            }
        }

        #[test]
        fn test_invalid_identifiers() {
            for name in [
                "",
                "Relay_Insert",
                "1starts_with_digit",
                "has-dash",
                "has space",
                "drop table; --",
                "name\0",
                "ok; SELECT 1",
            ] {
                assert!(!is_valid_identifier(name), "{name}");
            }
        }

        #[test]
        fn test_procedure_sql_shapes() {
            assert_eq!(
                procedure_sql("relay_insert", 3).unwrap(),
                "SELECT relay_insert($1, $2, $3)"
            );
            assert_eq!(
                procedure_sql("orphan_event_delete", 0).unwrap(),
                "SELECT orphan_event_delete()"
            );
            assert!(matches!(
                procedure_sql("bad name", 1).unwrap_err(),
                BigBrotrError::InvalidIdentifier(_)
            ));
        }
    }

    mod contract_tests {
        use super::*;
        use crate::config::DatabaseConfig;
        use crate::models::Relay;

        #[test]
        fn test_parallel_array_validation() {
            assert!(validate_parallel_arrays(&[3, 3, 3]).is_ok());
            assert!(validate_parallel_arrays(&[]).is_ok());
            let err = validate_parallel_arrays(&[3, 2, 3]).unwrap_err();
            assert!(matches!(
                err,
                BigBrotrError::RaggedRows {
                    row: 1,
                    got: 2,
                    expected: 3
                }
            ));
        }

        #[tokio::test]
        async fn test_batch_size_limit_enforced() {
            let mut config = DatabaseConfig::default();
            config.batch.max_size = 2;
            let db = Database::new(config);
            let relays: Vec<Relay> = (0..3)
                .map(|i| Relay::parse(&format!("wss://relay{i}.example.com")).unwrap())
                .collect();
            let err = db.insert_relays(&relays).await.unwrap_err();
            assert!(matches!(err, BigBrotrError::BatchTooLarge { got: 3, .. }));
        }

        #[tokio::test]
        async fn test_empty_batches_short_circuit() {
            // No pool connection exists, so anything that reaches the
            // database would fail; empty inputs must not.
            let db = Database::new(DatabaseConfig::default());
            assert_eq!(db.insert_relays(&[]).await.unwrap(), 0);
            assert_eq!(db.insert_events(&[]).await.unwrap(), 0);
            assert_eq!(db.insert_event_relays(&[], true).await.unwrap(), 0);
            assert_eq!(db.insert_metadata(&[]).await.unwrap(), 0);
            assert_eq!(db.upsert_service_state(&[]).await.unwrap(), 0);
            assert_eq!(db.delete_service_state(&[], &[], &[]).await.unwrap(), 0);
        }

        #[tokio::test]
        async fn test_ragged_delete_arrays_rejected() {
            let db = Database::new(DatabaseConfig::default());
            let err = db
                .delete_service_state(
                    &[ServiceName::Validator],
                    &[StateType::Candidate, StateType::Cursor],
                    &["wss://relay.example.com".to_string()],
                )
                .await
                .unwrap_err();
            assert!(matches!(err, BigBrotrError::RaggedRows { .. }));
        }

        #[tokio::test]
        async fn test_refresh_view_name_validated_before_dispatch() {
            let db = Database::new(DatabaseConfig::default());
            let err = db
                .refresh_materialized_view("bad view; drop table")
                .await
                .unwrap_err();
            assert!(matches!(err, BigBrotrError::InvalidIdentifier(_)));
        }

        #[test]
        fn test_raw_json_passthrough() {
            let canonical = r#"{"a":1,"b":[true,null]}"#;
            let wrapped = raw_json(canonical).unwrap();
            assert_eq!(wrapped.get(), canonical);
            assert!(raw_json("not json").is_err());
        }
    }
}
