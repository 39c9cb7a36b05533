//! Error types for pending-operation storage

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Durable storage unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
