//! Core error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unknown message kind: {0}")]
    UnknownKind(String),
}
