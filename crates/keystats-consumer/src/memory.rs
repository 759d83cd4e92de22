//! In-process broker with consumer-group semantics.
//!
//! [`MemoryBroker`] holds one topic as a set of append-only partition logs plus the state
//! of every consumer group reading it:
//!
//! - **Generations**: joining, leaving and [`MemoryBroker::rebalance`] each move the
//!   group to a new generation. Claims of the previous generation end.
//! - **Assignment**: round-robin over members in join order (`partition % members`).
//! - **Committed offsets**: advanced by `mark_record`, set by `reset_offset`. A new
//!   session starts each claimed partition at its committed offset, or at the start of
//!   the log when nothing was committed.
//! - **Pause/resume**: a paused member receives no records until resumed.
//!
//! Waiters are woken through a `watch` channel carrying a version counter that is bumped
//! after every state change.
//!
//! ```ignore
//! let broker = MemoryBroker::new("statistics", 4);
//! let group = broker.join("aggregators").await;
//! let producer = broker.producer();
//! producer.send_message(&Message::Delete(DeleteRequest::new("acme"))).await?;
//! ```

use crate::error::{ConsumerError, Result};
use crate::queue::{ConsumerGroup, GroupSession, GroupSessionHandle, PartitionClaim, QueueRecord, RecordProducer};
use async_trait::async_trait;
use bytes::Bytes;
use keystats_core::{partition_for_keystem, MessageKind, MESSAGE_TYPE_HEADER};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

const NO_GENERATION: i64 = i64::MIN;

#[derive(Default)]
struct GroupState {
    generation: i32,
    members: Vec<u64>,
    committed: HashMap<i32, i64>,
    positions: HashMap<i32, i64>,
    paused: HashSet<u64>,
}

impl GroupState {
    fn assignment(&self, member: u64, partitions: i32) -> Vec<i32> {
        match self.members.iter().position(|m| *m == member) {
            Some(index) => (0..partitions)
                .filter(|p| *p as usize % self.members.len() == index)
                .collect(),
            None => Vec::new(),
        }
    }

    fn is_current(&self, member: u64, generation: i32) -> bool {
        self.generation == generation && self.members.contains(&member)
    }
}

struct BrokerState {
    logs: Vec<Vec<QueueRecord>>,
    groups: HashMap<String, GroupState>,
    next_member_id: u64,
}

struct BrokerInner {
    topic: String,
    state: Mutex<BrokerState>,
    version: watch::Sender<u64>,
}

impl BrokerInner {
    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// In-process topic and consumer-group coordinator.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create a topic with `partitions` partitions (at least one).
    pub fn new(topic: impl Into<String>, partitions: u32) -> Self {
        let (version, _) = watch::channel(0);
        let logs = (0..partitions.max(1)).map(|_| Vec::new()).collect();
        Self {
            inner: Arc::new(BrokerInner {
                topic: topic.into(),
                state: Mutex::new(BrokerState {
                    logs,
                    groups: HashMap::new(),
                    next_member_id: 0,
                }),
                version,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub async fn partition_count(&self) -> i32 {
        self.inner.state.lock().await.logs.len() as i32
    }

    /// Append a record. Returns its offset.
    pub async fn produce(
        &self,
        partition: i32,
        headers: Vec<(String, Vec<u8>)>,
        payload: impl Into<Bytes>,
    ) -> Result<i64> {
        let offset = {
            let mut state = self.inner.state.lock().await;
            let partitions = state.logs.len();
            let log = usize::try_from(partition)
                .ok()
                .and_then(|p| state.logs.get_mut(p))
                .ok_or_else(|| {
                    ConsumerError::Queue(format!(
                        "partition {} out of range (topic has {})",
                        partition, partitions
                    ))
                })?;
            let offset = log.len() as i64;
            log.push(QueueRecord {
                partition,
                offset,
                headers,
                payload: payload.into(),
            });
            offset
        };
        self.inner.notify();
        Ok(offset)
    }

    /// Join `group_id` as a new member. Moves the group to a new generation.
    pub async fn join(&self, group_id: impl Into<String>) -> MemoryConsumerGroup {
        let group_id = group_id.into();
        let member_id = {
            let mut state = self.inner.state.lock().await;
            let member_id = state.next_member_id;
            state.next_member_id += 1;
            let group = state.groups.entry(group_id.clone()).or_default();
            group.members.push(member_id);
            group.generation += 1;
            tracing::debug!(group = %group_id, member_id, generation = group.generation, "Member joined");
            member_id
        };
        self.inner.notify();

        MemoryConsumerGroup {
            broker: Arc::clone(&self.inner),
            group_id,
            member_id,
            last_generation: AtomicI64::new(NO_GENERATION),
            closed: AtomicBool::new(false),
        }
    }

    /// Force a new generation with unchanged membership.
    pub async fn rebalance(&self, group_id: &str) {
        {
            let mut state = self.inner.state.lock().await;
            if let Some(group) = state.groups.get_mut(group_id) {
                group.generation += 1;
                tracing::debug!(group = %group_id, generation = group.generation, "Rebalance forced");
            }
        }
        self.inner.notify();
    }

    pub async fn generation(&self, group_id: &str) -> Option<i32> {
        let state = self.inner.state.lock().await;
        state.groups.get(group_id).map(|g| g.generation)
    }

    /// Next offset `group_id` would read on `partition` when a new session starts.
    pub async fn committed_offset(&self, group_id: &str, partition: i32) -> Option<i64> {
        let state = self.inner.state.lock().await;
        state
            .groups
            .get(group_id)
            .and_then(|g| g.committed.get(&partition).copied())
    }

    /// Offset the next record appended to `partition` will get.
    pub async fn end_offset(&self, partition: i32) -> i64 {
        let state = self.inner.state.lock().await;
        usize::try_from(partition)
            .ok()
            .and_then(|p| state.logs.get(p))
            .map(|log| log.len() as i64)
            .unwrap_or(0)
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
        }
    }
}

/// One member of a consumer group on a [`MemoryBroker`].
pub struct MemoryConsumerGroup {
    broker: Arc<BrokerInner>,
    group_id: String,
    member_id: u64,
    last_generation: AtomicI64,
    closed: AtomicBool,
}

impl MemoryConsumerGroup {
    pub fn member_id(&self) -> u64 {
        self.member_id
    }
}

#[async_trait]
impl ConsumerGroup for MemoryConsumerGroup {
    async fn next_session(&self) -> Result<GroupSessionHandle> {
        loop {
            let mut changes = self.broker.version.subscribe();
            {
                let mut state = self.broker.state.lock().await;
                let partitions = state.logs.len() as i32;
                if self.closed.load(Ordering::SeqCst) {
                    return Err(ConsumerError::SessionClosed);
                }
                let group = state
                    .groups
                    .get_mut(&self.group_id)
                    .filter(|g| g.members.contains(&self.member_id))
                    .ok_or(ConsumerError::SessionClosed)?;

                let generation = group.generation;
                if self.last_generation.load(Ordering::SeqCst) != i64::from(generation) {
                    let claimed = group.assignment(self.member_id, partitions);
                    for partition in &claimed {
                        let start = group.committed.get(partition).copied().unwrap_or(0);
                        group.positions.insert(*partition, start);
                    }
                    group.paused.remove(&self.member_id);
                    self.last_generation
                        .store(i64::from(generation), Ordering::SeqCst);

                    tracing::debug!(
                        group = %self.group_id,
                        member_id = self.member_id,
                        generation,
                        partitions = ?claimed,
                        "Session assigned"
                    );

                    let claims = claimed
                        .iter()
                        .map(|partition| {
                            Box::new(MemoryClaim {
                                broker: Arc::clone(&self.broker),
                                group_id: self.group_id.clone(),
                                member_id: self.member_id,
                                generation,
                                partition: *partition,
                            }) as Box<dyn PartitionClaim>
                        })
                        .collect();
                    let session = Arc::new(MemorySession {
                        broker: Arc::clone(&self.broker),
                        group_id: self.group_id.clone(),
                        member_id: self.member_id,
                        generation,
                        claimed,
                    });
                    return Ok(GroupSessionHandle { session, claims });
                }
            }
            if changes.changed().await.is_err() {
                return Err(ConsumerError::SessionClosed);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = self.broker.state.lock().await;
            if let Some(group) = state.groups.get_mut(&self.group_id) {
                let before = group.members.len();
                group.members.retain(|m| *m != self.member_id);
                group.paused.remove(&self.member_id);
                if group.members.len() != before {
                    group.generation += 1;
                }
            }
        }
        tracing::debug!(group = %self.group_id, member_id = self.member_id, "Member left");
        self.broker.notify();
        Ok(())
    }
}

struct MemorySession {
    broker: Arc<BrokerInner>,
    group_id: String,
    member_id: u64,
    generation: i32,
    claimed: Vec<i32>,
}

impl MemorySession {
    fn check_claimed(&self, partition: i32) -> Result<()> {
        if self.claimed.contains(&partition) {
            Ok(())
        } else {
            Err(ConsumerError::Queue(format!(
                "partition {} is not claimed in generation {}",
                partition, self.generation
            )))
        }
    }

    /// Apply `f` to the group state if this session is still current.
    async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut GroupState) + Send,
    {
        {
            let mut state = self.broker.state.lock().await;
            match state.groups.get_mut(&self.group_id) {
                Some(group) if group.is_current(self.member_id, self.generation) => f(group),
                _ => return,
            }
        }
        self.broker.notify();
    }
}

#[async_trait]
impl GroupSession for MemorySession {
    fn generation_id(&self) -> i32 {
        self.generation
    }

    fn claimed_partitions(&self) -> Vec<i32> {
        self.claimed.clone()
    }

    async fn pause_all(&self) -> Result<()> {
        let member = self.member_id;
        self.update(move |group| {
            group.paused.insert(member);
        })
        .await;
        Ok(())
    }

    async fn resume_all(&self) -> Result<()> {
        let member = self.member_id;
        self.update(move |group| {
            group.paused.remove(&member);
        })
        .await;
        Ok(())
    }

    async fn reset_offset(&self, partition: i32, offset: i64) -> Result<()> {
        self.check_claimed(partition)?;
        self.update(move |group| {
            group.positions.insert(partition, offset);
            group.committed.insert(partition, offset);
        })
        .await;
        Ok(())
    }

    async fn mark_record(&self, partition: i32, offset: i64) -> Result<()> {
        self.check_claimed(partition)?;
        self.update(move |group| {
            let committed = group.committed.entry(partition).or_insert(0);
            *committed = (*committed).max(offset + 1);
        })
        .await;
        Ok(())
    }
}

struct MemoryClaim {
    broker: Arc<BrokerInner>,
    group_id: String,
    member_id: u64,
    generation: i32,
    partition: i32,
}

#[async_trait]
impl PartitionClaim for MemoryClaim {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next(&mut self) -> Option<QueueRecord> {
        loop {
            let mut changes = self.broker.version.subscribe();
            {
                let mut state = self.broker.state.lock().await;
                let BrokerState { logs, groups, .. } = &mut *state;
                let group = groups.get_mut(&self.group_id)?;
                if !group.is_current(self.member_id, self.generation) {
                    return None;
                }
                if !group.paused.contains(&self.member_id) {
                    let position = group.positions.get(&self.partition).copied().unwrap_or(0);
                    let record = usize::try_from(self.partition)
                        .ok()
                        .and_then(|p| logs.get(p))
                        .and_then(|log| usize::try_from(position).ok().and_then(|i| log.get(i)));
                    if let Some(record) = record {
                        group.positions.insert(self.partition, position + 1);
                        return Some(record.clone());
                    }
                }
            }
            if changes.changed().await.is_err() {
                return None;
            }
        }
    }
}

/// Producer publishing onto a [`MemoryBroker`], routing by keystem hash.
#[derive(Clone)]
pub struct MemoryProducer {
    broker: MemoryBroker,
}

impl MemoryProducer {
    /// Publish a record with arbitrary headers to the keystem's partition.
    pub async fn send_raw(
        &self,
        keystem: &str,
        headers: Vec<(String, Vec<u8>)>,
        payload: impl Into<Bytes>,
    ) -> Result<(i32, i64)> {
        let partitions = self.broker.partition_count().await;
        let partition = partition_for_keystem(keystem, partitions as u32);
        let offset = self.broker.produce(partition, headers, payload).await?;
        Ok((partition, offset))
    }
}

#[async_trait]
impl RecordProducer for MemoryProducer {
    async fn send(&self, kind: MessageKind, keystem: &str, payload: Vec<u8>) -> Result<(i32, i64)> {
        let headers = vec![(
            MESSAGE_TYPE_HEADER.to_string(),
            kind.as_str().as_bytes().to_vec(),
        )];
        self.send_raw(keystem, headers, payload).await
    }
}
