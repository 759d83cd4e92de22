//! keystats Consumer
//!
//! The aggregation engine: consumes statistics samples and delete requests from a
//! consumer group, folds them into per-keystem aggregates and keeps the stored
//! aggregates and partition checkpoints consistent with each other.
//!
//! ## Components
//!
//! - [`queue`]: consumer-group abstraction the engine is written against
//! - [`memory::MemoryBroker`]: in-process implementation (local mode and tests)
//! - `kafka` (feature `kafka`): rdkafka implementation
//! - [`claims::ClaimTable`]: generation-scoped fan-out from one receive loop to claims
//! - [`router::MessageRouter`]: applies one record to the in-memory state
//! - [`flush::FlushCoordinator`]: writes offsets and aggregates in one transaction
//! - [`Aggregator`]: session manager tying the above together
//!
//! ## Usage Example
//!
//! ```ignore
//! use keystats_consumer::{Aggregator, MemoryBroker};
//!
//! let broker = MemoryBroker::new("statistics", 8);
//! let group = Arc::new(broker.join("aggregators").await);
//!
//! let aggregator = Aggregator::builder().store(store).build()?;
//! let handle = aggregator.spawn(group);
//! // ...
//! handle.shutdown().await?; // final flush, then leave the group
//! ```

pub mod aggregator;
pub mod claims;
pub mod config;
pub mod error;
pub mod flush;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod queue;
pub mod router;
pub mod state;

pub use aggregator::{Aggregator, AggregatorBuilder, AggregatorHandle};
pub use claims::{ClaimTable, Dispatch, QueuedClaim};
pub use config::AggregatorConfig;
pub use error::{ConsumerError, Result};
pub use flush::{FlushCoordinator, FlushTrigger};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumerGroup, KafkaProducer};
pub use memory::{MemoryBroker, MemoryConsumerGroup, MemoryProducer};
pub use queue::{
    ConsumerGroup, GroupSession, GroupSessionHandle, PartitionClaim, QueueRecord, RecordProducer,
};
pub use router::{MessageRouter, RouteOutcome, SkipReason};
pub use state::AggregationState;
