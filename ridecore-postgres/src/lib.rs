//! `PostgreSQL` adapter for the `RideCore` lifecycle engine.
//!
//! This crate implements the [`ridecore::store::LifecycleStore`] port on
//! top of `PostgreSQL` via sqlx. Atomicity notes:
//!
//! - Every mutating operation runs in a single transaction covering the
//!   aggregate write, the outbox row and the optional idempotency record.
//! - Compare-and-swap writes are conditional `UPDATE ... WHERE status = $n`
//!   statements; a zero row count is disambiguated into not-found versus
//!   conflict inside the same transaction.
//! - Outbox claims use `FOR UPDATE SKIP LOCKED`, so publisher replicas on
//!   separate connections never double-claim a row.
//! - The one-pending-offer-per-(ride, driver) invariant is a partial
//!   unique index; the insert surfaces violations as
//!   [`StoreError::DuplicateOffer`](ridecore::errors::StoreError).
//!
//! All queries use the runtime `sqlx::query` API, so the crate builds
//! without a database; migrations are embedded with `sqlx::migrate!`.

mod store;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tracing::info;

/// Errors raised while setting up the adapter itself.
///
/// Operational errors after setup surface through
/// [`ridecore::errors::StoreError`] like any other store.
#[derive(Debug, Error)]
pub enum PostgresSetupError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// Embedded migrations failed to apply.
    #[error("failed to run postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Configuration for the adapter's connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10).
    pub max_connections: u32,
    /// Timeout for acquiring a connection from the pool (default: 30s).
    pub acquire_timeout: Duration,
    /// Idle timeout for pooled connections (default: 10 minutes).
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// `PostgreSQL`-backed lifecycle store.
#[derive(Debug, Clone)]
pub struct PostgresLifecycleStore {
    pool: Pool<Postgres>,
}

impl PostgresLifecycleStore {
    /// Connects with the default pool configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresSetupError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with a custom pool configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresSetupError> {
        let connection_string = connection_string.into();
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresSetupError::ConnectionFailed)?;
        info!(
            max_connections = config.max_connections,
            "postgres connection pool initialized"
        );
        Ok(Self { pool })
    }

    /// Wraps an existing connection pool.
    ///
    /// Use this when pool configuration is owned elsewhere or the pool is
    /// shared across components.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), PostgresSetupError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresSetupError::MigrationFailed)?;
        info!("postgres migrations applied");
        Ok(())
    }

    /// Verifies connectivity with a trivial round trip.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}
