//! Queue abstraction.
//!
//! The engine is written against a consumer-group model:
//!
//! ```text
//! ConsumerGroup ──next_session()──► GroupSessionHandle
//!                                     ├── session: Arc<dyn GroupSession>   (generation, pause/resume, seek, mark)
//!                                     └── claims:  Vec<Box<dyn PartitionClaim>>  (one per owned partition)
//! ```
//!
//! A session lasts for one generation of the group. When membership changes the group
//! moves to a new generation, every claim of the old session ends (`next()` returns
//! `None`) and `next_session()` yields the new assignment.
//!
//! Implementations: [`MemoryBroker`](crate::memory::MemoryBroker) (in-process) and,
//! with the `kafka` feature, `KafkaConsumerGroup`.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use keystats_core::{Message, MessageKind};
use std::sync::Arc;

/// One record delivered from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub partition: i32,
    pub offset: i64,
    pub headers: Vec<(String, Vec<u8>)>,
    pub payload: Bytes,
}

impl QueueRecord {
    /// Value of the first header named `key`.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }
}

/// One generation of group membership.
#[async_trait]
pub trait GroupSession: Send + Sync {
    fn generation_id(&self) -> i32;

    /// Partitions owned by this member for this generation.
    fn claimed_partitions(&self) -> Vec<i32>;

    /// Stop delivering records on every claimed partition.
    async fn pause_all(&self) -> Result<()>;

    async fn resume_all(&self) -> Result<()>;

    /// Make `offset` the next record delivered on `partition`.
    async fn reset_offset(&self, partition: i32, offset: i64) -> Result<()>;

    /// Acknowledge that the record at `offset` has been handled.
    async fn mark_record(&self, partition: i32, offset: i64) -> Result<()>;
}

/// Ordered record stream for one claimed partition.
#[async_trait]
pub trait PartitionClaim: Send {
    fn partition(&self) -> i32;

    /// Next record, or `None` once the session has ended.
    async fn next(&mut self) -> Option<QueueRecord>;
}

pub struct GroupSessionHandle {
    pub session: Arc<dyn GroupSession>,
    pub claims: Vec<Box<dyn PartitionClaim>>,
}

impl std::fmt::Debug for GroupSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSessionHandle")
            .field("generation_id", &self.session.generation_id())
            .field("partitions", &self.session.claimed_partitions())
            .finish()
    }
}

/// Membership of one process in a consumer group.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Wait for the next generation this member has not seen yet.
    ///
    /// Returns `SessionClosed` once the member has been closed.
    async fn next_session(&self) -> Result<GroupSessionHandle>;

    /// Leave the group and release every claim.
    async fn close(&self) -> Result<()>;
}

/// Publishes records onto the statistics topic.
///
/// Implementations must route by keystem so that every record for one keystem lands on
/// the same partition.
#[async_trait]
pub trait RecordProducer: Send + Sync {
    /// Publish one encoded record. Returns the partition and offset it was written to.
    async fn send(&self, kind: MessageKind, keystem: &str, payload: Vec<u8>) -> Result<(i32, i64)>;

    async fn send_message(&self, message: &Message) -> Result<(i32, i64)> {
        let payload = message.encode()?;
        self.send(message.kind(), message.keystem(), payload).await
    }
}
