//! Flush coordination.
//!
//! A flush writes the full offset map and the full aggregate map in one store
//! transaction. The caller holds the state lock for the whole call, so no partition task
//! can mutate either map between snapshot and commit.
//!
//! On failure (store error, unacknowledged write, timeout) the in-memory state is left
//! untouched and the flush clock is not reset: the next trigger retries with everything
//! accumulated since the last successful flush.
//!
//! A state that belongs to no generation (no reload yet, or its session has ended) owns
//! no partitions, so flushing it writes nothing.

use crate::error::{ConsumerError, Result};
use crate::state::AggregationState;
use keystats_metadata::{FlushReceipt, StatsStore};
use keystats_observability::metrics::{FLUSHES_TOTAL, FLUSH_LATENCY};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// A delete request was applied.
    Delete,
    /// A sample was applied and the flush interval had elapsed.
    Interval,
    /// Final flush before releasing claims.
    Shutdown,
    /// Explicit request through `Aggregator::flush_now`.
    Manual,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Delete => "delete",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Shutdown => "shutdown",
            FlushTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct FlushCoordinator {
    store: Arc<dyn StatsStore>,
    timeout: Duration,
}

impl FlushCoordinator {
    pub fn new(store: Arc<dyn StatsStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Persist `state` as one transaction.
    pub async fn flush(
        &self,
        state: &mut AggregationState,
        trigger: FlushTrigger,
    ) -> Result<FlushReceipt> {
        if state.generation().is_none() {
            tracing::debug!(trigger = %trigger, "No live session, nothing to write");
            return Ok(FlushReceipt::default());
        }

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.store.write_flush(state.batch())).await;
        FLUSH_LATENCY.observe(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(receipt)) => {
                state.mark_flushed(Instant::now());
                FLUSHES_TOTAL
                    .with_label_values(&[trigger.as_str(), "ok"])
                    .inc();
                tracing::debug!(
                    trigger = %trigger,
                    offsets = receipt.offsets_written,
                    key_stats = receipt.key_stats_written,
                    "Stats written"
                );
                Ok(receipt)
            }
            Ok(Err(e)) => {
                FLUSHES_TOTAL
                    .with_label_values(&[trigger.as_str(), "error"])
                    .inc();
                tracing::error!(trigger = %trigger, error = %e, "Write aborted, state kept for retry");
                Err(e.into())
            }
            Err(_) => {
                FLUSHES_TOTAL
                    .with_label_values(&[trigger.as_str(), "timeout"])
                    .inc();
                tracing::error!(
                    trigger = %trigger,
                    timeout = ?self.timeout,
                    "Write timed out, state kept for retry"
                );
                Err(ConsumerError::FlushTimeout(self.timeout))
            }
        }
    }
}
