//! SQLite-backed durable tier.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use super::{CacheEntry, CacheError, DurableStore};

#[derive(Debug, sqlx::FromRow)]
struct CacheRow {
    canonical_id: String,
    payload: String,
    options: String,
    expires_at: i64,
}

impl CacheRow {
    fn decode(self) -> Result<CacheEntry, CacheError> {
        Ok(CacheEntry {
            canonical_id: self.canonical_id,
            post: serde_json::from_str(&self.payload)?,
            options: serde_json::from_str(&self.options)?,
            expires_at: self.expires_at,
        })
    }
}

/// Durable tier stored in a single SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the cache database and ensure the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Several invocations may share the file; writes are serialised by SQLite.
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| {
                format!("Failed to open cache database: {}", path.display())
            })?;

        let store = Self::from_pool(pool);
        store.ensure_schema().await?;
        info!(path = %path.display(), "Dedup cache database ready");
        Ok(store)
    }

    /// Wrap an existing pool without touching the schema.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the cache table and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS dedup_cache (
                canonical_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                options TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                committed_at INTEGER NOT NULL,
                notified_at INTEGER,
                delivery_attempts INTEGER NOT NULL DEFAULT 0
            )
            ",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create dedup_cache table")?;

        // Tables created before the attempt counter existed.
        let (has_attempts,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pragma_table_info('dedup_cache') WHERE name = 'delivery_attempts'",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to inspect dedup_cache columns")?;
        if has_attempts == 0 {
            sqlx::query(
                "ALTER TABLE dedup_cache ADD COLUMN delivery_attempts INTEGER NOT NULL DEFAULT 0",
            )
            .execute(&self.pool)
            .await
            .context("Failed to add delivery_attempts column")?;
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dedup_cache_expires_at ON dedup_cache(expires_at)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create expiry index")?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_dedup_cache_undelivered
            ON dedup_cache(committed_at) WHERE notified_at IS NULL
            ",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create undelivered index")?;

        debug!("Dedup cache schema ensured");
        Ok(())
    }
}

/// A missing table is the "namespace not initialised" case; everything else
/// is a real fault.
fn classify(err: sqlx::Error) -> CacheError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.message().contains("no such table") {
            return CacheError::NotFound;
        }
    }
    CacheError::Durable(err)
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn fetch(&self, canonical_id: &str) -> Result<Option<CacheEntry>, CacheError> {
        let row: Option<CacheRow> = sqlx::query_as(
            "SELECT canonical_id, payload, options, expires_at FROM dedup_cache WHERE canonical_id = ?",
        )
        .bind(canonical_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(CacheRow::decode).transpose()
    }

    async fn insert_if_absent(&self, entry: &CacheEntry) -> Result<bool, CacheError> {
        let payload = serde_json::to_string(&entry.post)?;
        let options = serde_json::to_string(&entry.options)?;

        let result = sqlx::query(
            r"
            INSERT OR IGNORE INTO dedup_cache
                (canonical_id, payload, options, expires_at, committed_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(&entry.canonical_id)
        .bind(payload)
        .bind(options)
        .bind(entry.expires_at)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_notified(&self, canonical_id: &str) -> Result<(), CacheError> {
        sqlx::query(
            "UPDATE dedup_cache SET notified_at = ? WHERE canonical_id = ? AND notified_at IS NULL",
        )
        .bind(Utc::now().timestamp())
        .bind(canonical_id)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn record_failed_delivery(&self, canonical_id: &str) -> Result<(), CacheError> {
        sqlx::query(
            r"
            UPDATE dedup_cache SET delivery_attempts = delivery_attempts + 1
            WHERE canonical_id = ? AND notified_at IS NULL
            ",
        )
        .bind(canonical_id)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn undelivered(
        &self,
        committed_before: i64,
        limit: u32,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        let rows: Vec<CacheRow> = sqlx::query_as(
            r"
            SELECT canonical_id, payload, options, expires_at
            FROM dedup_cache
            WHERE notified_at IS NULL AND committed_at <= ?
            ORDER BY delivery_attempts ASC, committed_at ASC
            LIMIT ?
            ",
        )
        .bind(committed_before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter().map(CacheRow::decode).collect()
    }

    async fn reap_expired(&self, now: i64) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM dedup_cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }
}
