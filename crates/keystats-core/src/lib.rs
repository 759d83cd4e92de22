//! keystats core types
//!
//! Pure data and arithmetic shared by every other crate in the workspace:
//!
//! - [`Sample`]: statistics extracted from one proxied request
//! - [`DeleteRequest`]: operator request to reset one keystem
//! - [`KeyStats`]: running summary for a single keystem
//! - [`CrossKeyStats`]: rollup over every stored [`KeyStats`]
//! - [`MessageKind`] / [`Message`]: the record envelope carried by the queue
//! - [`partition_for_keystem`]: the producer-side routing hash
//!
//! Nothing in this crate performs I/O.

pub mod error;
pub mod message;
pub mod partitioner;
pub mod stats;

pub use error::{CoreError, Result};
pub use message::{Message, MessageKind, MESSAGE_TYPE_HEADER};
pub use partitioner::{fnv1a_32, partition_for_keystem};
pub use stats::{
    CrossKeyStats, DeleteRequest, KeyStats, KeystemAvgLatency, KeystemMaxLatency, MaxLatency,
    Sample,
};
