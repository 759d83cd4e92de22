//! In-memory [`StatsStore`] with failure injection.
//!
//! Same atomicity as the SQLite store: a flush either replaces every record in the batch
//! or none. Intended for tests and for local runs without a database file.
//!
//! ```ignore
//! let store = MemoryStatsStore::new();
//! store.fail_next_flushes(1);          // next write_flush returns Unacknowledged
//! store.fail_checkpoint_reads(true);   // get_checkpoints returns Unavailable
//! store.set_flush_delay(Duration::from_secs(5));
//! ```

use crate::{
    error::{MetadataError, Result},
    types::{FlushBatch, FlushReceipt},
    StatsStore,
};
use async_trait::async_trait;
use keystats_core::KeyStats;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    offsets: HashMap<i32, i64>,
    key_stats: BTreeMap<String, KeyStats>,
}

#[derive(Default)]
pub struct MemoryStatsStore {
    tables: RwLock<Tables>,
    failing_flushes: AtomicUsize,
    failing_checkpoint_reads: AtomicBool,
    flush_delay: Mutex<Option<Duration>>,
    committed_flushes: AtomicU64,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` flushes fail as unacknowledged without writing anything.
    pub fn fail_next_flushes(&self, n: usize) {
        self.failing_flushes.store(n, Ordering::SeqCst);
    }

    pub fn fail_checkpoint_reads(&self, fail: bool) {
        self.failing_checkpoint_reads.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every flush before committing.
    pub fn set_flush_delay(&self, delay: Option<Duration>) {
        if let Ok(mut guard) = self.flush_delay.lock() {
            *guard = delay;
        }
    }

    /// Number of flushes committed so far.
    pub fn committed_flushes(&self) -> u64 {
        self.committed_flushes.load(Ordering::SeqCst)
    }

    /// Copy of every stored checkpoint.
    pub async fn checkpoints(&self) -> HashMap<i32, i64> {
        self.tables.read().await.offsets.clone()
    }

    fn flush_delay(&self) -> Option<Duration> {
        self.flush_delay.lock().ok().and_then(|guard| *guard)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_flushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StatsStore for MemoryStatsStore {
    async fn get_checkpoints(&self, partitions: &[i32]) -> Result<HashMap<i32, i64>> {
        if self.failing_checkpoint_reads.load(Ordering::SeqCst) {
            return Err(MetadataError::Unavailable(
                "checkpoint reads are failing".to_string(),
            ));
        }

        let tables = self.tables.read().await;
        Ok(partitions
            .iter()
            .filter_map(|p| tables.offsets.get(p).map(|offset| (*p, *offset)))
            .collect())
    }

    async fn get_key_stats(&self, keystems: &[String]) -> Result<HashMap<String, KeyStats>> {
        let tables = self.tables.read().await;
        Ok(keystems
            .iter()
            .filter_map(|k| tables.key_stats.get(k).map(|s| (k.clone(), s.clone())))
            .collect())
    }

    async fn list_key_stats(&self) -> Result<Vec<KeyStats>> {
        Ok(self.tables.read().await.key_stats.values().cloned().collect())
    }

    async fn write_flush(&self, batch: FlushBatch<'_>) -> Result<FlushReceipt> {
        if let Some(delay) = self.flush_delay() {
            tokio::time::sleep(delay).await;
        }

        if self.take_injected_failure() {
            return Err(MetadataError::Unacknowledged {
                what: "key_stats".to_string(),
                expected: batch.key_stats.len() as u64,
                acknowledged: 0,
            });
        }

        let mut tables = self.tables.write().await;
        for (partition, offset) in batch.offsets {
            tables.offsets.insert(*partition, *offset);
        }
        for (keystem, stats) in batch.key_stats {
            tables.key_stats.insert(keystem.clone(), stats.clone());
        }
        self.committed_flushes.fetch_add(1, Ordering::SeqCst);

        Ok(FlushReceipt {
            offsets_written: batch.offsets.len() as u64,
            key_stats_written: batch.key_stats.len() as u64,
        })
    }
}
