// src/worker.rs
//! Queue-to-database side: decodes profile messages and stores them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::message::Profile;
use crate::rabbitmq::DeliveryHandler;

/// Upper bound on the start-up `CREATE TABLE`.
pub const SCHEMA_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

const INSERT_PROFILE: &str = "INSERT INTO profile (name, url) VALUES ($1, $2)";

const CREATE_PROFILE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS profile (
        name TEXT,
        url  TEXT
    )
"#;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Invalid database configuration: {0}")]
    Configuration(String),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => DbError::Query(db_err.message().to_string()),
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::Configuration(msg) => DbError::Configuration(msg.to_string()),
            sqlx::Error::Io(io) => DbError::Connection(io.to_string()),
            sqlx::Error::PoolClosed => DbError::Connection("pool closed".to_string()),
            _ => DbError::Query(err.to_string()),
        }
    }
}

/// Destination for decoded profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync + 'static {
    async fn insert(&self, profile: &Profile) -> Result<(), DbError>;

    /// Creates the destination table if the store needs one.
    async fn ensure_schema(&self) -> Result<(), DbError> {
        Ok(())
    }
}

/// PostgreSQL implementation of [`ProfileStore`].
#[derive(Debug, Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds the pool without opening a connection, so the worker can start
    /// while the database is still down. Queries give up after the configured
    /// acquire timeout instead of waiting for the database to come back.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_lazy(&config.uri)?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn insert(&self, profile: &Profile) -> Result<(), DbError> {
        sqlx::query(INSERT_PROFILE)
            .bind(&profile.name)
            .bind(&profile.url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), DbError> {
        sqlx::query(CREATE_PROFILE_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

/// Runs [`ProfileStore::ensure_schema`] for at most `limit`. Returns whether
/// the table is known to exist.
///
/// Failure is only logged: inserts into a missing table fail and are
/// requeued until the table shows up.
pub async fn bootstrap_schema(store: Arc<dyn ProfileStore>, limit: Duration) -> bool {
    match timeout(limit, store.ensure_schema()).await {
        Ok(Ok(())) => {
            info!("Profile table ready");
            true
        }
        Ok(Err(err)) => {
            warn!("Could not create profile table: {}", err);
            false
        }
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "Timed out creating profile table");
            false
        }
    }
}

/// Handler for the profile queue.
///
/// Payloads that do not decode are logged and reported as handled, so they
/// are acked and never come back. A store failure is returned as is and the
/// message is requeued.
pub fn profile_handler(store: Arc<dyn ProfileStore>) -> DeliveryHandler {
    DeliveryHandler::new(move |payload: Vec<u8>| {
        let store = store.clone();
        async move {
            let profile = match Profile::from_slice(&payload) {
                Ok(profile) => profile,
                Err(err) => {
                    warn!(bytes = payload.len(), "Discarding undecodable message: {}", err);
                    return Ok(());
                }
            };

            store.insert(&profile).await?;
            debug!(name = %profile.name, "Profile stored");
            Ok::<(), anyhow::Error>(())
        }
    })
}
