//! Connection pools for [`PostgresStore`](super::PostgresStore).
//!
//! Listings, profiles and reviews may come from a replica. Anything that feeds a
//! precondition (`get`, `rating_snapshot`), every write and the change listener
//! use the primary.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{HandymanError, Result};

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub database_url: String,
    /// Optional read replica for lag-tolerant listings.
    pub replica_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/handyman".to_string(),
            replica_url: None,
            max_connections: 10,
            acquire_timeout_ms: 3_000,
        }
    }
}

impl PoolConfig {
    fn options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_millis(self.acquire_timeout_ms))
    }
}

/// Primary pool plus an optional replica.
#[derive(Debug, Clone)]
pub struct StorePools {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl StorePools {
    pub fn new(primary: PgPool) -> Self {
        Self {
            primary,
            replica: None,
        }
    }

    pub fn with_replica(mut self, replica: PgPool) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Connect the primary and, if configured, the replica.
    pub async fn connect(config: &PoolConfig) -> Result<Self> {
        let primary = config
            .options()
            .connect(&config.database_url)
            .await
            .map_err(|e| HandymanError::StoreUnavailable(format!("connect primary: {}", e)))?;
        let mut pools = Self::new(primary);

        if let Some(url) = &config.replica_url {
            let replica = config
                .options()
                .connect(url)
                .await
                .map_err(|e| HandymanError::StoreUnavailable(format!("connect replica: {}", e)))?;
            pools = pools.with_replica(replica);
        }

        tracing::info!(
            max_connections = config.max_connections,
            replica = config.replica_url.is_some(),
            "Connected request store"
        );
        Ok(pools)
    }

    /// Pools whose replica side runs every transaction read-only, so a write
    /// routed to the replica fails loudly in tests.
    pub async fn with_read_only_replica(primary: PgPool) -> std::result::Result<Self, sqlx::Error> {
        let replica = PgPoolOptions::new()
            .max_connections(primary.options().get_max_connections())
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET default_transaction_read_only = on")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(primary.connect_options().as_ref().clone())
            .await?;
        Ok(Self::new(primary).with_replica(replica))
    }

    pub fn read(&self) -> &PgPool {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    pub fn write(&self) -> &PgPool {
        &self.primary
    }
}

impl From<PgPool> for StorePools {
    fn from(pool: PgPool) -> Self {
        Self::new(pool)
    }
}
