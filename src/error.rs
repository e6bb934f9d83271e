use thiserror::Error;

use crate::storage::StorageError;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(format!("Database error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The persisted chain and the writer's view of it disagree. Recording
    /// must halt until the writer is resynchronized.
    #[error("Chain integrity error at sequence {sequence}: {message}")]
    ChainIntegrity { sequence: u64, message: String },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Audit writer not initialized: {0}")]
    NotInitialized(String),

    #[error("No pending events to checkpoint")]
    NothingToCheckpoint,

    /// The events were committed but the checkpoint they triggered was not.
    /// Later writes retry the seal.
    #[error("Events committed through sequence {committed_through}, checkpoint failed: {message}")]
    CheckpointFailed {
        committed_through: u64,
        message: String,
    },

    #[error("Merkle tree error: {0}")]
    Merkle(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

impl LedgerError {
    pub fn chain_integrity(sequence: u64, message: impl Into<String>) -> Self {
        Self::ChainIntegrity {
            sequence,
            message: message.into(),
        }
    }

    /// Whether the error means the writer must stop recording.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::ChainIntegrity { .. })
    }
}
