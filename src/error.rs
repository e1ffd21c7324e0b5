//! Error types for KVChain

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    /// An operation kind the replay does not understand.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),
    #[error("Invalid block linkage: {0}")]
    InvalidBlockLinkage(String),
    #[error("Invalid proof of work: {0}")]
    InvalidProofOfWork(String),
    #[error("Mining cancelled")]
    MiningCancelled,
    #[error("Mining timed out after {0:?}")]
    MiningTimedOut(std::time::Duration),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Mining worker failed: {0}")]
    WorkerFailed(String),
    #[error("Chain actor unavailable")]
    ActorUnavailable,
}

impl ChainError {
    /// True for failures of the persistence layer rather than of chain logic.
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            ChainError::IoError(_) | ChainError::BincodeError(_) | ChainError::DatabaseError(_)
        )
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::DatabaseError(format!("JSON encoding failed: {}", err))
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
