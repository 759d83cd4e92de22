//! keystats Metadata Store
//!
//! Durable state for the aggregation engine. Two record families live here:
//!
//! - **Checkpoints**: per partition, the offset of the last record whose effect is
//!   included in the stored aggregates.
//! - **Key aggregates**: per keystem, the running [`KeyStats`] document.
//!
//! The two are only meaningful as a pair. A checkpoint without the aggregates it was
//! taken against would make replay double count (or lose) samples, so both families are
//! written by one call, [`StatsStore::write_flush`], inside one transaction.
//!
//! ## Architecture
//!
//! ```text
//!  ┌───────────────┐  write_flush (offsets + aggregates, one tx)
//!  │  Aggregator   │ ─────────────────────────────┐
//!  └───────┬───────┘                              ▼
//!          │ get_checkpoints / get_key_stats ┌──────────────┐
//!          └────────────────────────────────►│  StatsStore  │
//!  ┌───────────────┐  list_key_stats         │   (SQLite)   │
//!  │   Query API   │ ───────────────────────►└──────────────┘
//!  └───────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use keystats_metadata::{FlushBatch, SqliteStatsStore, StatsStore};
//!
//! let store = SqliteStatsStore::new("keystats.db").await?;
//! store.write_flush(FlushBatch::new(&offsets, &key_stats)).await?;
//!
//! let resumed = store.get_checkpoints(&[0, 1, 2]).await?;
//! let rollup = store.cross_key_stats().await?;
//! ```

use async_trait::async_trait;
use keystats_core::{CrossKeyStats, KeyStats};
use std::collections::HashMap;

pub mod error;
pub mod memory;
pub mod store;
pub mod types;

pub use error::{MetadataError, Result};
pub use memory::MemoryStatsStore;
pub use store::SqliteStatsStore;
pub use types::{FlushBatch, FlushReceipt};

/// Checkpoint store and aggregate store behind one transactional interface.
///
/// Implementations must be shareable across partition tasks (`Arc<dyn StatsStore>`).
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Stored checkpoints for the given partitions.
    ///
    /// Partitions without a checkpoint are absent from the returned map.
    async fn get_checkpoints(&self, partitions: &[i32]) -> Result<HashMap<i32, i64>>;

    /// Stored aggregates for the given keystems. Unknown keystems are absent.
    async fn get_key_stats(&self, keystems: &[String]) -> Result<HashMap<String, KeyStats>>;

    /// Every stored aggregate.
    async fn list_key_stats(&self) -> Result<Vec<KeyStats>>;

    /// Rollup over every stored aggregate, rebuilt on each call.
    async fn cross_key_stats(&self) -> Result<CrossKeyStats> {
        let all = self.list_key_stats().await?;
        Ok(CrossKeyStats::from_key_stats(all.iter()))
    }

    /// Persist the full offset map and the full aggregate map atomically.
    ///
    /// Each record is replaced if present and inserted otherwise. If any upsert errors
    /// or is not acknowledged the whole transaction is rolled back and nothing is
    /// written.
    ///
    /// # Errors
    ///
    /// - `Unacknowledged`: an upsert reported fewer rows than expected
    /// - `DatabaseError`: the transaction failed to begin, execute or commit
    async fn write_flush(&self, batch: FlushBatch<'_>) -> Result<FlushReceipt>;
}
