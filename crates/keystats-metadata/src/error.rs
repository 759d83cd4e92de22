//! Metadata Error Types
//!
//! ## Error Categories
//!
//! ### Database Errors
//! - `DatabaseError`: SQLite operation failed (connection, query, commit)
//! - `MigrationError`: embedded schema migrations could not be applied
//!
//! ### Data Errors
//! - `SerializationError`: a stored aggregate document could not be (de)serialized
//!
//! ### Flush Errors
//! - `Unacknowledged`: an upsert inside a flush transaction did not report the expected
//!   number of written rows. The transaction is rolled back.
//! - `Unavailable`: the store refused the operation (used by the in-memory store's
//!   failure injection).
//!
//! All store operations return `Result<T>`, aliased to `Result<T, MetadataError>`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Write not acknowledged for {what}: expected {expected} rows, acknowledged {acknowledged}")]
    Unacknowledged {
        what: String,
        expected: u64,
        acknowledged: u64,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::migrate::MigrateError> for MetadataError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        MetadataError::MigrationError(e.to_string())
    }
}
