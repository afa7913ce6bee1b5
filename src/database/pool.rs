//! PostgreSQL connection pool with establishment retry and transient
//! error classification.
//!
//! Wraps [`sqlx::PgPool`]. Connection establishment retries with
//! exponential (or linear) backoff; `connect()`/`close()` are
//! idempotent and guarded by a lifecycle mutex so concurrent callers
//! collapse to a single pool. Server session settings
//! (`application_name`, `TimeZone`, `statement_timeout`) apply to every
//! connection in the pool.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::sync::Mutex;

use crate::config::DatabaseConfig;
use crate::error::{BigBrotrError, Result};

pub struct Pool {
    config: DatabaseConfig,
    inner: Mutex<Option<PgPool>>,
}

impl Pool {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Create the pool with retry on failure. Idempotent: a second call
    /// while connected returns immediately.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let db = &self.config;
        let password = db.resolve_password()?;

        tracing::info!(
            target: "bigbrotr::database::pool",
            host = %db.host,
            port = db.port,
            database = %db.database,
            "connection_starting"
        );

        let connect_options = PgConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .database(&db.database)
            .username(&db.user)
            .password(&password)
            .application_name(&db.server.application_name)
            .options([
                ("TimeZone", db.server.timezone.clone()),
                (
                    "statement_timeout",
                    db.server.statement_timeout_ms.to_string(),
                ),
            ]);

        let pool_options = PgPoolOptions::new()
            .min_connections(db.limits.min_size)
            .max_connections(db.limits.max_size)
            .idle_timeout(Duration::from_secs(db.limits.idle_lifetime_s))
            .max_lifetime(Duration::from_secs(db.limits.max_lifetime_s))
            .acquire_timeout(Duration::from_secs(db.limits.acquisition_timeout_s));

        let max_attempts = db.retry.max_attempts;
        for attempt in 0..max_attempts {
            match pool_options
                .clone()
                .connect_with(connect_options.clone())
                .await
            {
                Ok(pool) => {
                    *guard = Some(pool);
                    tracing::info!(target: "bigbrotr::database::pool", "connection_established");
                    return Ok(());
                }
                Err(e) => {
                    if attempt + 1 >= max_attempts {
                        tracing::error!(
                            target: "bigbrotr::database::pool",
                            attempts = attempt + 1,
                            error = %e,
                            "connection_failed"
                        );
                        return Err(BigBrotrError::Connection(format!(
                            "failed to connect after {} attempts: {e}",
                            attempt + 1
                        )));
                    }
                    let delay = db.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        target: "bigbrotr::database::pool",
                        attempt = attempt + 1,
                        delay_s = delay.as_secs_f64(),
                        error = %e,
                        "connection_retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(BigBrotrError::Connection(
            "connection retry loop exhausted".to_string(),
        ))
    }

    /// Close the pool and release all connections. Idempotent.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
            tracing::info!(target: "bigbrotr::database::pool", "connection_closed");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Cheap handle to the underlying pool (connections are acquired
    /// lazily per query).
    pub async fn get(&self) -> Result<PgPool> {
        self.inner
            .lock()
            .await
            .clone()
            .ok_or_else(|| BigBrotrError::Connection("pool not connected".to_string()))
    }
}

/// Only connection-level failures are retried; errors reported by the
/// server (syntax, constraint violations) propagate immediately.
pub fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_transient(&io));
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(!is_transient(&sqlx::Error::ColumnNotFound("x".into())));
    }

    #[tokio::test]
    async fn test_get_before_connect_fails() {
        let pool = Pool::new(DatabaseConfig::default());
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, BigBrotrError::Connection(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pool = Pool::new(DatabaseConfig::default());
        pool.close().await;
        pool.close().await;
        assert!(!pool.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_requires_password_env() {
        let mut config = DatabaseConfig::default();
        config.password_env = "BIGBROTR_TEST_MISSING_PASSWORD".to_string();
        let pool = Pool::new(config);
        let err = pool.connect().await.unwrap_err();
        assert!(matches!(err, BigBrotrError::Configuration(_)));
    }
}
