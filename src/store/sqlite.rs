//! SQLite-backed store for custom per-client limits.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::ratelimit::{ClientLimit, LimitManager, LimitProvider};

/// Upper bound on any single store operation. The data plane treats a
/// slower lookup as a miss and falls back to default limits.
const OP_TIMEOUT: Duration = Duration::from_millis(100);

const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS client_limits (
    client_id TEXT PRIMARY KEY NOT NULL,
    capacity INTEGER NOT NULL,
    rate REAL NOT NULL,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
)";

const GET_LIMIT_SQL: &str = "SELECT capacity, rate FROM client_limits WHERE client_id = ?";

const SET_LIMIT_SQL: &str = "\
INSERT INTO client_limits (client_id, capacity, rate, updated_at)
VALUES (?, ?, ?, CURRENT_TIMESTAMP)
ON CONFLICT(client_id) DO UPDATE SET
    capacity = excluded.capacity,
    rate = excluded.rate,
    updated_at = CURRENT_TIMESTAMP";

const DELETE_LIMIT_SQL: &str = "DELETE FROM client_limits WHERE client_id = ?";

/// `LimitProvider` and `LimitManager` over a SQLite database.
///
/// One object serves both capability sets: the rate limiter holds it as
/// a provider, the admin API as a manager.
pub struct SqliteLimitStore {
    pool: SqlitePool,
}

impl SqliteLimitStore {
    /// Opens the database at `path` (creating it if missing) and ensures
    /// the `client_limits` table exists.
    pub async fn connect(path: &str) -> Result<Self> {
        tracing::info!(path, "initializing sqlite limit store");
        let pool = SqlitePool::connect(&format!("sqlite:{path}?mode=rwc"))
            .await
            .with_context(|| format!("failed to open sqlite database at {path}"))?;
        sqlx::query(CREATE_TABLE_SQL)
            .execute(&pool)
            .await
            .context("failed to create client_limits table")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl LimitProvider for SqliteLimitStore {
    async fn get_limit(&self, client_id: &str) -> Option<ClientLimit> {
        let query = sqlx::query(GET_LIMIT_SQL)
            .bind(client_id)
            .fetch_optional(&self.pool);
        match tokio::time::timeout(OP_TIMEOUT, query).await {
            Ok(Ok(Some(row))) => match (row.try_get("capacity"), row.try_get("rate")) {
                (Ok(capacity), Ok(rate)) => Some(ClientLimit { capacity, rate }),
                _ => {
                    tracing::error!(client = client_id, "malformed limit row");
                    None
                }
            },
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                tracing::error!(client = client_id, error = %e, "failed to query limit");
                None
            }
            Err(_) => {
                tracing::error!(client = client_id, "limit lookup timed out");
                None
            }
        }
    }

    async fn close(&self) -> Result<()> {
        tracing::info!("closing sqlite limit store");
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl LimitManager for SqliteLimitStore {
    async fn get_limit(&self, client_id: &str) -> Option<ClientLimit> {
        LimitProvider::get_limit(self, client_id).await
    }

    async fn set_limit(&self, client_id: &str, limit: ClientLimit) -> Result<()> {
        let query = sqlx::query(SET_LIMIT_SQL)
            .bind(client_id)
            .bind(limit.capacity)
            .bind(limit.rate)
            .execute(&self.pool);
        tokio::time::timeout(OP_TIMEOUT, query)
            .await
            .context("set limit timed out")?
            .context("failed to execute set limit statement")?;
        tracing::info!(
            client = client_id,
            capacity = limit.capacity,
            rate = limit.rate,
            "set custom limit"
        );
        Ok(())
    }

    async fn delete_limit(&self, client_id: &str) -> Result<()> {
        let query = sqlx::query(DELETE_LIMIT_SQL)
            .bind(client_id)
            .execute(&self.pool);
        let result = tokio::time::timeout(OP_TIMEOUT, query)
            .await
            .context("delete limit timed out")?
            .context("failed to execute delete limit statement")?;
        if result.rows_affected() == 0 {
            tracing::info!(client = client_id, "no custom limit to delete");
        } else {
            tracing::info!(client = client_id, "deleted custom limit");
        }
        Ok(())
    }
}
