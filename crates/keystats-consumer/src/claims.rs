//! Generation-scoped fan-out of one record stream into partition claims.
//!
//! Poll-based clients (rdkafka) deliver every partition's records, and every rebalance
//! callback, through a single receive loop. [`ClaimTable`] sits between that loop and
//! the engine's per-partition claims:
//!
//! ```text
//! receive loop ──push()──► ClaimTable ◄──next()── QueuedClaim (one per partition)
//! rebalance callback ──assign()/revoke()──┘
//! ```
//!
//! - Every `assign`, `revoke` and `close` starts a new generation and empties every
//!   queue. A claim only yields records while the table is still at the generation it
//!   was created for, so claims of a superseded generation end immediately instead of
//!   waiting for anyone to hand out the next session.
//! - Records for an assigned partition are queued even before the session that will
//!   consume them exists; the receive loop never waits for a claim to be installed.
//! - `reset` drops everything queued for the partition and sets a floor: records
//!   fetched before a seek and below its target are discarded.
//! - A full partition queue makes `push` wait until the claim drains it or the
//!   generation changes.
//!
//! State changes are published on a `watch` version counter, like the in-process broker.

use crate::queue::{PartitionClaim, QueueRecord};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

pub const DEFAULT_CLAIM_CAPACITY: usize = 1024;

/// What [`ClaimTable::push`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Queued for the partition's claim in the current generation.
    Queued,
    /// The partition is not assigned to this member; the record was dropped.
    Unassigned,
    /// The record predates the partition's last seek; it was dropped.
    BelowFloor,
}

#[derive(Debug, Default)]
struct PartitionQueue {
    records: VecDeque<QueueRecord>,
    floor: Option<i64>,
}

#[derive(Debug, Default)]
struct TableState {
    generation: i32,
    assigned: HashSet<i32>,
    queues: HashMap<i32, PartitionQueue>,
    closed: bool,
}

impl TableState {
    fn advance(&mut self, assigned: HashSet<i32>) -> i32 {
        self.generation += 1;
        self.assigned = assigned;
        self.queues.clear();
        self.generation
    }
}

pub struct ClaimTable {
    state: Mutex<TableState>,
    version: watch::Sender<u64>,
    capacity: usize,
}

impl Default for ClaimTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CLAIM_CAPACITY)
    }

    /// Table whose partition queues hold at most `capacity` records each.
    pub fn with_capacity(capacity: usize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(TableState::default()),
            version,
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Current generation; 0 until the first assignment.
    pub fn generation(&self) -> i32 {
        self.lock().generation
    }

    pub fn is_current(&self, generation: i32) -> bool {
        let state = self.lock();
        !state.closed && state.generation == generation
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Start a generation owning `partitions`. Returns the new generation.
    pub fn assign(&self, partitions: &[i32]) -> i32 {
        let generation = self.lock().advance(partitions.iter().copied().collect());
        self.notify();
        generation
    }

    /// Start a generation owning nothing. Returns the new generation.
    pub fn revoke(&self) -> i32 {
        let generation = self.lock().advance(HashSet::new());
        self.notify();
        generation
    }

    /// End every claim for good; `next_generation` returns `None` from now on.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.advance(HashSet::new());
            state.closed = true;
        }
        self.notify();
    }

    /// Wait for a generation newer than `after`. Returns it with its sorted partitions,
    /// or `None` once the table is closed.
    pub async fn next_generation(&self, after: i32) -> Option<(i32, Vec<i32>)> {
        let mut changes = self.version.subscribe();
        loop {
            {
                let state = self.lock();
                if state.closed {
                    return None;
                }
                if state.generation > after {
                    let mut partitions: Vec<i32> = state.assigned.iter().copied().collect();
                    partitions.sort_unstable();
                    return Some((state.generation, partitions));
                }
            }
            if changes.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Claim `partition` for `generation`.
    pub fn claim(self: &Arc<Self>, generation: i32, partition: i32) -> QueuedClaim {
        QueuedClaim {
            table: Arc::clone(self),
            generation,
            partition,
        }
    }

    /// Queue `record` for its partition's claim, waiting while the queue is full.
    pub async fn push(&self, record: QueueRecord) -> Dispatch {
        let mut changes = self.version.subscribe();
        loop {
            {
                let mut state = self.lock();
                if !state.assigned.contains(&record.partition) {
                    return Dispatch::Unassigned;
                }
                let queue = state.queues.entry(record.partition).or_default();
                if queue.floor.map_or(false, |floor| record.offset < floor) {
                    return Dispatch::BelowFloor;
                }
                if queue.records.len() < self.capacity {
                    queue.records.push_back(record);
                    drop(state);
                    self.notify();
                    return Dispatch::Queued;
                }
            }
            if changes.changed().await.is_err() {
                return Dispatch::Unassigned;
            }
        }
    }

    /// Drop what is queued for `partition` and make `offset` its floor.
    ///
    /// Returns `false`, changing nothing, when `generation` is no longer current.
    pub fn reset(&self, generation: i32, partition: i32, offset: i64) -> bool {
        {
            let mut state = self.lock();
            if state.closed || state.generation != generation {
                return false;
            }
            let queue = state.queues.entry(partition).or_default();
            queue.records.clear();
            queue.floor = Some(offset);
        }
        self.notify();
        true
    }

    /// Records currently queued for `partition`.
    pub fn queued(&self, partition: i32) -> usize {
        self.lock()
            .queues
            .get(&partition)
            .map_or(0, |q| q.records.len())
    }

    /// `None` once `generation` is over, otherwise the next queued record if any.
    fn pop(&self, generation: i32, partition: i32) -> Option<Option<QueueRecord>> {
        let record = {
            let mut state = self.lock();
            if state.closed || state.generation != generation {
                return None;
            }
            state.queues.get_mut(&partition).and_then(|queue| {
                let floor = queue.floor;
                std::iter::from_fn(|| queue.records.pop_front())
                    .find(|r| floor.map_or(true, |f| r.offset >= f))
            })
        };
        if record.is_some() {
            self.notify();
        }
        Some(record)
    }
}

/// Record stream for one partition in one generation of a [`ClaimTable`].
pub struct QueuedClaim {
    table: Arc<ClaimTable>,
    generation: i32,
    partition: i32,
}

impl QueuedClaim {
    pub fn generation(&self) -> i32 {
        self.generation
    }
}

#[async_trait]
impl PartitionClaim for QueuedClaim {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next(&mut self) -> Option<QueueRecord> {
        let mut changes = self.table.version.subscribe();
        loop {
            match self.table.pop(self.generation, self.partition) {
                None => return None,
                Some(Some(record)) => return Some(record),
                Some(None) => {}
            }
            if changes.changed().await.is_err() {
                return None;
            }
        }
    }
}
