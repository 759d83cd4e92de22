//! Flush transaction input and output.

use keystats_core::KeyStats;
use std::collections::HashMap;

/// Everything one flush persists: the full offset map and the full aggregate map.
///
/// Borrowed so the caller can keep its state locked for the duration of the write.
#[derive(Debug, Clone, Copy)]
pub struct FlushBatch<'a> {
    pub offsets: &'a HashMap<i32, i64>,
    pub key_stats: &'a HashMap<String, KeyStats>,
}

impl<'a> FlushBatch<'a> {
    pub fn new(offsets: &'a HashMap<i32, i64>, key_stats: &'a HashMap<String, KeyStats>) -> Self {
        Self { offsets, key_stats }
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty() && self.key_stats.is_empty()
    }
}

/// Rows acknowledged by a committed flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReceipt {
    pub offsets_written: u64,
    pub key_stats_written: u64,
}
