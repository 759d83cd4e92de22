//! Error types for the aggregation engine and the queue layer.
//!
//! Errors below the session manager are recovered locally: the engine logs them and
//! retries at the next natural trigger (next record, next flush, next session). Only
//! configuration errors surface to the caller of [`Aggregator::builder`].
//!
//! [`Aggregator::builder`]: crate::Aggregator::builder

use std::time::Duration;
use thiserror::Error;

/// Convenience type alias for `Result<T, ConsumerError>`.
pub type Result<T> = std::result::Result<T, ConsumerError>;

#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Checkpoint or aggregate store failure.
    #[error("Metadata error: {0}")]
    Metadata(#[from] keystats_metadata::MetadataError),

    /// Record envelope could not be decoded.
    #[error("Record error: {0}")]
    Core(#[from] keystats_core::CoreError),

    /// The queue layer rejected an operation (produce, seek, pause, commit).
    #[error("Queue error: {0}")]
    Queue(String),

    /// The consumer group member has been closed; no further sessions will start.
    #[error("Consumer group session closed")]
    SessionClosed,

    /// A flush transaction did not complete within the configured timeout.
    #[error("Flush timed out after {0:?}")]
    FlushTimeout(Duration),

    /// Invalid engine or queue configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}
