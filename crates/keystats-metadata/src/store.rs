//! SQLite Stats Store Implementation
//!
//! Implements [`StatsStore`] on an embedded SQLite database.
//!
//! ## Durability
//!
//! File-backed stores open the database in WAL mode with `synchronous = FULL`, so a
//! committed flush has reached stable storage before `write_flush` returns. That is the
//! single-node counterpart of a majority write concern: a flush is either durable and
//! acknowledged, or it is reported as failed.
//!
//! ## Usage
//!
//! ### File-Based (Production)
//! ```ignore
//! let store = SqliteStatsStore::new("./data/keystats.db").await?;
//! ```
//!
//! ### In-Memory (Testing)
//! ```ignore
//! let store = SqliteStatsStore::new_in_memory().await?;
//! ```
//!
//! The in-memory pool holds exactly one connection for its whole life. Every SQLite
//! `:memory:` connection is its own database, so a second connection would not see the
//! schema created by the migrations.
//!
//! ## Schema
//!
//! - `partition_offsets(partition_id, last_offset, updated_at)`
//! - `key_stats(keystem, document, total_requests, updated_at)`; `document` is the JSON
//!   encoding of [`KeyStats`], `total_requests` is denormalized for inspection.

use crate::{
    error::{MetadataError, Result},
    types::{FlushBatch, FlushReceipt},
    StatsStore,
};
use async_trait::async_trait;
use keystats_core::KeyStats;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-based stats store.
pub struct SqliteStatsStore {
    pool: SqlitePool,
}

impl SqliteStatsStore {
    /// Open (or create) the database at `path` and apply migrations.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Full)
                .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!(path = %path.as_ref().display(), "Opened SQLite stats store");

        Ok(Self { pool })
    }

    /// Create in-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn decode_document(document: &str) -> Result<KeyStats> {
        Ok(serde_json::from_str(document)?)
    }
}

fn check_acknowledged(what: &str, acknowledged: u64) -> Result<()> {
    if acknowledged != 1 {
        return Err(MetadataError::Unacknowledged {
            what: what.to_string(),
            expected: 1,
            acknowledged,
        });
    }
    Ok(())
}

#[async_trait]
impl StatsStore for SqliteStatsStore {
    async fn get_checkpoints(&self, partitions: &[i32]) -> Result<HashMap<i32, i64>> {
        if partitions.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT partition_id, last_offset FROM partition_offsets WHERE partition_id IN (",
        );
        let mut ids = query.separated(", ");
        for partition in partitions {
            ids.push_bind(*partition);
        }
        ids.push_unseparated(")");

        let rows = query.build().fetch_all(&self.pool).await?;

        let mut checkpoints = HashMap::with_capacity(rows.len());
        for row in rows {
            let partition: i64 = row.try_get("partition_id")?;
            let offset: i64 = row.try_get("last_offset")?;
            checkpoints.insert(partition as i32, offset);
        }
        Ok(checkpoints)
    }

    async fn get_key_stats(&self, keystems: &[String]) -> Result<HashMap<String, KeyStats>> {
        if keystems.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT keystem, document FROM key_stats WHERE keystem IN (");
        let mut names = query.separated(", ");
        for keystem in keystems {
            names.push_bind(keystem.as_str());
        }
        names.push_unseparated(")");

        let rows = query.build().fetch_all(&self.pool).await?;

        let mut stats = HashMap::with_capacity(rows.len());
        for row in rows {
            let keystem: String = row.try_get("keystem")?;
            let document: String = row.try_get("document")?;
            stats.insert(keystem, Self::decode_document(&document)?);
        }
        Ok(stats)
    }

    async fn list_key_stats(&self) -> Result<Vec<KeyStats>> {
        let rows = sqlx::query("SELECT document FROM key_stats ORDER BY keystem")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let document: String = row.try_get("document")?;
                Self::decode_document(&document)
            })
            .collect()
    }

    async fn write_flush(&self, batch: FlushBatch<'_>) -> Result<FlushReceipt> {
        let now = Self::now_ms();
        let mut receipt = FlushReceipt::default();

        // Dropping the transaction on an early return rolls it back
        let mut tx = self.pool.begin().await?;

        for (partition, offset) in batch.offsets {
            let result = sqlx::query(
                r#"
                INSERT INTO partition_offsets (partition_id, last_offset, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(partition_id) DO UPDATE SET
                    last_offset = excluded.last_offset,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(*partition)
            .bind(*offset)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            check_acknowledged("partition_offsets", result.rows_affected())?;
            receipt.offsets_written += 1;
        }

        for (keystem, stats) in batch.key_stats {
            let document = serde_json::to_string(stats)?;
            let result = sqlx::query(
                r#"
                INSERT INTO key_stats (keystem, document, total_requests, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(keystem) DO UPDATE SET
                    document = excluded.document,
                    total_requests = excluded.total_requests,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(keystem.as_str())
            .bind(document)
            .bind(stats.total_requests as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            check_acknowledged("key_stats", result.rows_affected())?;
            receipt.key_stats_written += 1;
        }

        tx.commit().await?;

        tracing::debug!(
            offsets = receipt.offsets_written,
            key_stats = receipt.key_stats_written,
            "Flush committed"
        );

        Ok(receipt)
    }
}
