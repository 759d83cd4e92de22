//! Kafka implementation of the queue layer (feature `kafka`).
//!
//! rdkafka delivers rebalance callbacks on whichever task polls the consumer, so a
//! single pump task owns `recv()` and pushes every record into a [`ClaimTable`], which
//! hands them to the claims of the current session.
//!
//! - Generations are counted locally: every assign or revoke callback starts a new
//!   table generation. Claims of the previous generation end at once, so the engine can
//!   move on to `next_session` while the pump keeps receiving.
//! - `reset_offset` seeks the partition and drops what was prefetched before the seek.
//! - `mark_record` stores `offset + 1` for the next auto-commit
//!   (`enable.auto.offset.store = false`).

use crate::claims::{ClaimTable, Dispatch};
use crate::error::{ConsumerError, Result};
use crate::queue::{
    ConsumerGroup, GroupSession, GroupSessionHandle, PartitionClaim, QueueRecord, RecordProducer,
};
use async_trait::async_trait;
use bytes::Bytes;
use keystats_core::{partition_for_keystem, MessageKind, MESSAGE_TYPE_HEADER};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::Offset;
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);
const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

impl From<KafkaError> for ConsumerError {
    fn from(e: KafkaError) -> Self {
        ConsumerError::Queue(e.to_string())
    }
}

struct GroupContext {
    claims: Arc<ClaimTable>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions: Vec<i32> = tpl.elements().iter().map(|e| e.partition()).collect();
                let generation = self.claims.assign(&partitions);
                tracing::info!(generation, partitions = ?partitions, "Kafka rebalance: partitions assigned");
            }
            Rebalance::Revoke(tpl) => {
                let generation = self.claims.revoke();
                tracing::info!(generation, count = tpl.count(), "Kafka rebalance: partitions revoked");
            }
            Rebalance::Error(e) => {
                tracing::warn!(error = %e, "Kafka rebalance error");
            }
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

/// Consumer group member backed by an rdkafka `StreamConsumer`.
pub struct KafkaConsumerGroup {
    consumer: Arc<GroupConsumer>,
    topic: String,
    claims: Arc<ClaimTable>,
    last_generation: AtomicI32,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaConsumerGroup {
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> Result<Self> {
        let claims = Arc::new(ClaimTable::new());
        let consumer: GroupConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "10000")
            .create_with_context(GroupContext {
                claims: Arc::clone(&claims),
            })?;
        consumer.subscribe(&[topic])?;

        let consumer = Arc::new(consumer);
        let pump = tokio::spawn(pump(Arc::clone(&consumer), Arc::clone(&claims)));

        tracing::info!(brokers, group_id, topic, "Kafka consumer subscribed");

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            claims,
            last_generation: AtomicI32::new(0),
            pump: Mutex::new(Some(pump)),
        })
    }

    fn stop_pump(&self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(pump) = pump.take() {
                pump.abort();
            }
        }
    }
}

async fn pump(consumer: Arc<GroupConsumer>, claims: Arc<ClaimTable>) {
    loop {
        let record = match consumer.recv().await {
            Ok(message) => to_record(&message),
            Err(e) => {
                tracing::warn!(error = %e, "Kafka receive failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let (partition, offset) = (record.partition, record.offset);
        match claims.push(record).await {
            Dispatch::Queued => {}
            Dispatch::Unassigned => {
                tracing::debug!(partition, offset, "Record for unassigned partition dropped")
            }
            Dispatch::BelowFloor => {
                tracing::debug!(partition, offset, "Record fetched before seek dropped")
            }
        }
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> QueueRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec).unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();

    QueueRecord {
        partition: message.partition(),
        offset: message.offset(),
        headers,
        payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn next_session(&self) -> Result<GroupSessionHandle> {
        let after = self.last_generation.load(Ordering::SeqCst);
        let (generation, partitions) = self
            .claims
            .next_generation(after)
            .await
            .ok_or(ConsumerError::SessionClosed)?;
        self.last_generation.store(generation, Ordering::SeqCst);

        let claims = partitions
            .iter()
            .map(|partition| {
                Box::new(self.claims.claim(generation, *partition)) as Box<dyn PartitionClaim>
            })
            .collect();
        let session = Arc::new(KafkaSession {
            consumer: Arc::clone(&self.consumer),
            topic: self.topic.clone(),
            generation,
            partitions,
            claims: Arc::clone(&self.claims),
        });
        Ok(GroupSessionHandle { session, claims })
    }

    async fn close(&self) -> Result<()> {
        if self.claims.is_closed() {
            return Ok(());
        }

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            tracing::warn!(error = %e, "Final offset commit failed");
        }
        self.consumer.unsubscribe();
        self.stop_pump();
        self.claims.close();

        tracing::info!(topic = %self.topic, "Kafka consumer closed");
        Ok(())
    }
}

impl Drop for KafkaConsumerGroup {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

struct KafkaSession {
    consumer: Arc<GroupConsumer>,
    topic: String,
    generation: i32,
    partitions: Vec<i32>,
    claims: Arc<ClaimTable>,
}

impl KafkaSession {
    fn superseded(&self) -> ConsumerError {
        ConsumerError::Queue(format!("generation {} has been superseded", self.generation))
    }

    fn check_current(&self) -> Result<()> {
        if self.claims.is_current(self.generation) {
            Ok(())
        } else {
            Err(self.superseded())
        }
    }
}

#[async_trait]
impl GroupSession for KafkaSession {
    fn generation_id(&self) -> i32 {
        self.generation
    }

    fn claimed_partitions(&self) -> Vec<i32> {
        self.partitions.clone()
    }

    async fn pause_all(&self) -> Result<()> {
        self.check_current()?;
        let assignment = self.consumer.assignment()?;
        self.consumer.pause(&assignment)?;
        Ok(())
    }

    async fn resume_all(&self) -> Result<()> {
        let assignment = self.consumer.assignment()?;
        self.consumer.resume(&assignment)?;
        Ok(())
    }

    async fn reset_offset(&self, partition: i32, offset: i64) -> Result<()> {
        self.check_current()?;
        self.consumer
            .seek(&self.topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)?;
        if !self.claims.reset(self.generation, partition, offset) {
            return Err(self.superseded());
        }
        self.consumer.store_offset(&self.topic, partition, offset)?;
        Ok(())
    }

    async fn mark_record(&self, partition: i32, offset: i64) -> Result<()> {
        self.check_current()?;
        self.consumer.store_offset(&self.topic, partition, offset + 1)?;
        Ok(())
    }
}

/// Producer publishing onto the statistics topic, routing by keystem hash.
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    partitions: u32,
}

impl KafkaProducer {
    /// Connect and look up the topic's partition count.
    pub fn new(brokers: &str, topic: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        let metadata = producer
            .client()
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)?;
        let partitions = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(|t| t.partitions().len() as u32)
            .filter(|n| *n > 0)
            .ok_or_else(|| ConsumerError::ConfigError(format!("topic {} has no partitions", topic)))?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
            partitions,
        })
    }
}

#[async_trait]
impl RecordProducer for KafkaProducer {
    async fn send(&self, kind: MessageKind, keystem: &str, payload: Vec<u8>) -> Result<(i32, i64)> {
        let partition = partition_for_keystem(keystem, self.partitions);
        let headers = OwnedHeaders::new().insert(Header {
            key: MESSAGE_TYPE_HEADER,
            value: Some(kind.as_str()),
        });
        let record = FutureRecord::to(&self.topic)
            .partition(partition)
            .key(keystem)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(record, Timeout::After(PRODUCE_TIMEOUT))
            .await
            .map_err(|(e, _)| ConsumerError::Queue(e.to_string()))
    }
}
