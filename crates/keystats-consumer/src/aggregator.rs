//! Consumer-group session manager.
//!
//! ## Lifecycle
//!
//! ```text
//! run()
//!  └─ loop: next_session()
//!       ├─ spawn one task per claimed partition
//!       │    ├─ generation check (reload on change)
//!       │    └─ for each record: lock → route → maybe flush → unlock → mark
//!       ├─ wait for every claim task (claims end on rebalance or shutdown)
//!       └─ unless shutdown ended it: retire the state (no generation, nothing to flush)
//!  └─ on shutdown: final flush, then close the group (releases claims)
//! ```
//!
//! ## Rebalance
//!
//! The first claim task of a session that sees a generation different from the one the
//! state was loaded for performs the reload, holding the state lock throughout:
//!
//! 1. pause every claimed partition
//! 2. read checkpoints for exactly the claimed partitions
//! 3. seek each checkpointed partition to `checkpoint + 1`
//! 4. discard every in-memory aggregate and replace the offset map
//! 5. resume
//!
//! A checkpoint read failure is logged and counted; consumption continues from the
//! queue's committed offsets.
//!
//! Between the end of one session and the reload for the next, the state belongs to no
//! generation. A shutdown or manual flush in that window writes nothing, so this member
//! never writes checkpoints for partitions that may already belong to another member.
//!
//! ## Flush triggers
//!
//! - after every applied delete request
//! - after an applied sample, if `flush_interval` has elapsed since the last successful
//!   flush (or none has succeeded yet)
//! - once on shutdown
//! - on demand through [`Aggregator::flush_now`]

use crate::config::AggregatorConfig;
use crate::error::{ConsumerError, Result};
use crate::flush::{FlushCoordinator, FlushTrigger};
use crate::queue::{ConsumerGroup, GroupSession, GroupSessionHandle, PartitionClaim};
use crate::router::{MessageRouter, RouteOutcome};
use crate::state::AggregationState;
use keystats_core::{KeyStats, MessageKind};
use keystats_metadata::{FlushReceipt, StatsStore};
use keystats_observability::metrics::{
    CHECKPOINT_RELOAD_ERRORS_TOTAL, PARTITIONS_CLAIMED, REBALANCES_TOTAL,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

const SESSION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Why a claim task stopped consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimEnd {
    /// Shutdown was signalled while the session was live.
    Shutdown,
    /// The claim's generation is over.
    Superseded,
}

/// Builder for [`Aggregator`].
#[derive(Default)]
pub struct AggregatorBuilder {
    config: AggregatorConfig,
    store: Option<Arc<dyn StatsStore>>,
}

impl AggregatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: AggregatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the checkpoint and aggregate store.
    pub fn store(mut self, store: Arc<dyn StatsStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.config.flush_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Aggregator> {
        let store = self
            .store
            .ok_or_else(|| ConsumerError::ConfigError("store required".into()))?;
        self.config.validate()?;

        Ok(Aggregator {
            inner: Arc::new(Engine {
                router: MessageRouter::new(Arc::clone(&store)),
                flusher: FlushCoordinator::new(Arc::clone(&store), self.config.flush_timeout),
                state: Mutex::new(AggregationState::new()),
                store,
                config: self.config,
            }),
        })
    }
}

struct Engine {
    config: AggregatorConfig,
    store: Arc<dyn StatsStore>,
    state: Mutex<AggregationState>,
    router: MessageRouter,
    flusher: FlushCoordinator,
}

/// Aggregation engine: consumes one consumer group and maintains per-keystem aggregates.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Engine>,
}

impl Aggregator {
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::new()
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    /// Consume `group` until `shutdown` flips to `true` (or its sender is dropped) or the
    /// group is closed elsewhere.
    ///
    /// On exit performs one final flush and then closes the group.
    pub async fn run(
        &self,
        group: Arc<dyn ConsumerGroup>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!(
            group_id = %self.inner.config.group_id,
            topic = %self.inner.config.topic,
            flush_interval = ?self.inner.config.flush_interval,
            "Aggregator started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => break,
                next = group.next_session() => next,
            };

            match next {
                Ok(handle) => self.run_session(handle, &shutdown).await,
                Err(ConsumerError::SessionClosed) => {
                    tracing::info!("Consumer group closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to start session, retrying");
                    tokio::select! {
                        biased;
                        _ = shutdown_signalled(&mut shutdown) => break,
                        _ = tokio::time::sleep(SESSION_RETRY_DELAY) => {}
                    }
                }
            }
        }

        PARTITIONS_CLAIMED.set(0);
        match self.flush(FlushTrigger::Shutdown).await {
            Ok(receipt) => tracing::info!(
                offsets = receipt.offsets_written,
                key_stats = receipt.key_stats_written,
                "Final flush complete"
            ),
            Err(e) => tracing::error!(error = %e, "Final flush failed"),
        }

        group.close().await?;
        tracing::info!("Aggregator stopped");
        Ok(())
    }

    /// Spawn [`Aggregator::run`] on the runtime.
    pub fn spawn(&self, group: Arc<dyn ConsumerGroup>) -> AggregatorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let aggregator = self.clone();
        let task = tokio::spawn(async move { aggregator.run(group, shutdown_rx).await });
        AggregatorHandle { shutdown_tx, task }
    }

    /// Flush the current state now.
    pub async fn flush_now(&self) -> Result<FlushReceipt> {
        self.flush(FlushTrigger::Manual).await
    }

    /// In-memory aggregate for `keystem`, if held.
    pub async fn key_stats(&self, keystem: &str) -> Option<KeyStats> {
        self.inner.state.lock().await.key_stats().get(keystem).cloned()
    }

    /// In-memory offset map (last handled offset per partition).
    pub async fn offsets(&self) -> HashMap<i32, i64> {
        self.inner.state.lock().await.offsets().clone()
    }

    /// Generation the in-memory state was last loaded for.
    pub async fn generation(&self) -> Option<i32> {
        self.inner.state.lock().await.generation()
    }

    async fn flush(&self, trigger: FlushTrigger) -> Result<FlushReceipt> {
        let mut state = self.inner.state.lock().await;
        self.inner.flusher.flush(&mut state, trigger).await
    }

    async fn run_session(&self, handle: GroupSessionHandle, shutdown: &watch::Receiver<bool>) {
        let GroupSessionHandle { session, claims } = handle;
        let generation = session.generation_id();
        PARTITIONS_CLAIMED.set(claims.len() as i64);
        tracing::info!(
            generation,
            partitions = ?session.claimed_partitions(),
            "Session started"
        );

        let mut tasks = JoinSet::new();
        for claim in claims {
            let engine = Arc::clone(&self.inner);
            let session = Arc::clone(&session);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { engine.consume_claim(session, claim, shutdown).await });
        }

        let mut shut_down = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ClaimEnd::Shutdown) => shut_down = true,
                Ok(ClaimEnd::Superseded) => {}
                Err(e) => tracing::error!(generation, error = %e, "Claim task failed"),
            }
        }

        // Shutdown keeps the state for the final flush; any other end means the
        // partitions may already belong to someone else
        if !shut_down {
            self.inner.state.lock().await.retire();
        }
        tracing::info!(generation, shut_down, "Session ended");
    }
}

impl Engine {
    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut claim: Box<dyn PartitionClaim>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ClaimEnd {
        let partition = claim.partition();
        let generation = session.generation_id();

        if !self.ensure_generation(session.as_ref()).await {
            tracing::debug!(partition, generation, "Claim belongs to a superseded generation");
            return ClaimEnd::Superseded;
        }

        loop {
            let record = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => return ClaimEnd::Shutdown,
                record = claim.next() => match record {
                    Some(record) => record,
                    None => return ClaimEnd::Superseded,
                },
            };

            if !self.handle_record(generation, &record).await {
                tracing::debug!(partition, generation, "Generation changed, leaving claim");
                return ClaimEnd::Superseded;
            }

            if let Err(e) = session.mark_record(record.partition, record.offset).await {
                tracing::warn!(partition, offset = record.offset, error = %e, "Failed to mark record");
            }
        }
    }

    /// Reload state if `session` starts a generation the state has not seen.
    ///
    /// Returns `false` when the state already belongs to a newer generation.
    async fn ensure_generation(&self, session: &dyn GroupSession) -> bool {
        let generation = session.generation_id();
        let mut state = self.state.lock().await;
        match state.generation() {
            Some(current) if current == generation => return true,
            Some(current) if current > generation => return false,
            _ => {}
        }

        tracing::info!(
            previous = ?state.generation(),
            generation,
            "Partition reassignment detected, fetching stored data"
        );
        REBALANCES_TOTAL
            .with_label_values(&[self.config.group_id.as_str()])
            .inc();

        if let Err(e) = session.pause_all().await {
            tracing::warn!(error = %e, "Failed to pause partitions");
        }

        let partitions = session.claimed_partitions();
        let checkpoints = match tokio::time::timeout(
            self.config.flush_timeout,
            self.store.get_checkpoints(&partitions),
        )
        .await
        {
            Ok(Ok(checkpoints)) => checkpoints,
            Ok(Err(e)) => {
                CHECKPOINT_RELOAD_ERRORS_TOTAL.inc();
                tracing::error!(error = %e, "Failed to load checkpoints, resuming from committed offsets");
                HashMap::new()
            }
            Err(_) => {
                CHECKPOINT_RELOAD_ERRORS_TOTAL.inc();
                tracing::error!(
                    timeout = ?self.config.flush_timeout,
                    "Checkpoint load timed out, resuming from committed offsets"
                );
                HashMap::new()
            }
        };

        for (partition, offset) in &checkpoints {
            if let Err(e) = session.reset_offset(*partition, offset + 1).await {
                tracing::warn!(partition, offset, error = %e, "Failed to reset partition offset");
            }
        }
        tracing::info!(
            generation,
            partitions = ?partitions,
            checkpoints = ?checkpoints,
            "Checkpoints reloaded"
        );

        state.reload(generation, checkpoints);

        if let Err(e) = session.resume_all().await {
            tracing::warn!(error = %e, "Failed to resume partitions");
        }
        true
    }

    /// Route one record and run any flush it triggers.
    ///
    /// Returns `false` without touching the state when the state has moved on to another
    /// generation.
    async fn handle_record(&self, generation: i32, record: &crate::queue::QueueRecord) -> bool {
        let mut state = self.state.lock().await;
        if state.generation() != Some(generation) {
            return false;
        }

        let trigger = match self.router.route(&mut state, record).await {
            RouteOutcome::Applied {
                kind: MessageKind::Delete,
                ..
            } => Some(FlushTrigger::Delete),
            RouteOutcome::Applied {
                kind: MessageKind::Stats,
                ..
            } if state.flush_due(self.config.flush_interval, Instant::now()) => {
                Some(FlushTrigger::Interval)
            }
            _ => None,
        };

        if let Some(trigger) = trigger {
            if let Err(e) = self.flusher.flush(&mut state, trigger).await {
                tracing::debug!(trigger = %trigger, error = %e, "Flush deferred to next trigger");
            }
        }
        true
    }
}

/// Handle to an aggregator running on its own task.
pub struct AggregatorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl AggregatorHandle {
    /// Stop consuming, run the final flush, close the group and wait for completion.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.task
            .await
            .map_err(|e| ConsumerError::Queue(format!("aggregator task failed: {}", e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Resolves once `shutdown` holds `true` or its sender is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
