//! Error types for the Sponge state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("environment {environment} is locked by {holder} ({operation}) since {acquired_at}")]
    Locked {
        environment: String,
        holder: String,
        operation: String,
        acquired_at: u64,
    },

    #[error("lock {lock_id} is not held on environment {environment}")]
    LockNotHeld { environment: String, lock_id: String },
}
