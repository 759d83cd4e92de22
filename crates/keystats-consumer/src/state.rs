//! In-memory aggregation state.
//!
//! One [`AggregationState`] is shared by every partition task of an engine, behind a
//! single `tokio::sync::Mutex`. The keystem map and the offset map are only ever read or
//! written together under that lock, so a flush always sees a pair of maps that
//! describe the same set of handled records.

use keystats_core::KeyStats;
use keystats_metadata::{FlushBatch, StatsStore};
use keystats_observability::metrics::{HYDRATIONS_TOTAL, KEYSTEMS_TRACKED};
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct AggregationState {
    key_stats: HashMap<String, KeyStats>,
    offsets: HashMap<i32, i64>,
    generation: Option<i32>,
    last_flush: Option<Instant>,
}

impl AggregationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation the maps were last reloaded for.
    pub fn generation(&self) -> Option<i32> {
        self.generation
    }

    pub fn key_stats(&self) -> &HashMap<String, KeyStats> {
        &self.key_stats
    }

    pub fn offsets(&self) -> &HashMap<i32, i64> {
        &self.offsets
    }

    pub fn last_flush(&self) -> Option<Instant> {
        self.last_flush
    }

    /// Discard every aggregate and replace the offset map with freshly loaded checkpoints.
    ///
    /// Partitions no longer claimed drop out of the offset map, so a later flush can
    /// never overwrite another member's checkpoint with a stale offset.
    pub fn reload(&mut self, generation: i32, checkpoints: HashMap<i32, i64>) {
        self.key_stats.clear();
        self.offsets = checkpoints;
        self.generation = Some(generation);
        KEYSTEMS_TRACKED.set(0);
    }

    /// Drop everything held for the session that just ended.
    ///
    /// The state belongs to no generation until the next reload, and a flush in
    /// between writes nothing.
    pub fn retire(&mut self) {
        self.key_stats.clear();
        self.offsets.clear();
        self.generation = None;
        KEYSTEMS_TRACKED.set(0);
    }

    /// Record `offset` as the last handled record of `partition`.
    pub fn record_offset(&mut self, partition: i32, offset: i64) {
        self.offsets.insert(partition, offset);
    }

    /// Aggregate for `keystem`, loading it from `store` on first touch.
    ///
    /// A store read failure is logged and the aggregate starts empty.
    pub async fn hydrate(&mut self, store: &dyn StatsStore, keystem: &str) -> &mut KeyStats {
        if !self.key_stats.contains_key(keystem) {
            let stored = match store.get_key_stats(&[keystem.to_string()]).await {
                Ok(mut found) => {
                    let stored = found.remove(keystem);
                    let source = if stored.is_some() { "store" } else { "empty" };
                    HYDRATIONS_TOTAL.with_label_values(&[source]).inc();
                    stored
                }
                Err(e) => {
                    HYDRATIONS_TOTAL.with_label_values(&["error"]).inc();
                    tracing::error!(keystem, error = %e, "Failed to load stored aggregate, starting empty");
                    None
                }
            };
            self.key_stats.insert(
                keystem.to_string(),
                stored.unwrap_or_else(|| KeyStats::new(keystem)),
            );
            KEYSTEMS_TRACKED.set(self.key_stats.len() as i64);
        }

        self.key_stats
            .entry(keystem.to_string())
            .or_insert_with(|| KeyStats::new(keystem))
    }

    /// Reset the aggregate for `keystem`, creating it empty if it is not held.
    pub fn reset(&mut self, keystem: &str) {
        self.key_stats
            .entry(keystem.to_string())
            .or_insert_with(|| KeyStats::new(keystem))
            .reset();
        KEYSTEMS_TRACKED.set(self.key_stats.len() as i64);
    }

    /// True when no flush has succeeded yet or `interval` has passed since the last one.
    pub fn flush_due(&self, interval: Duration, now: Instant) -> bool {
        match self.last_flush {
            Some(last) => now.saturating_duration_since(last) >= interval,
            None => true,
        }
    }

    pub fn mark_flushed(&mut self, at: Instant) {
        self.last_flush = Some(at);
    }

    /// Borrowed view of both maps for one flush transaction.
    pub fn batch(&self) -> FlushBatch<'_> {
        FlushBatch::new(&self.offsets, &self.key_stats)
    }
}
