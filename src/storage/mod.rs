//! WORM Storage
//!
//! Write-once copies of checkpoint bundles and evidence artifacts with
//! retention locks and legal holds.

pub mod archive;
pub mod backend;
pub mod filesystem;
pub mod memory;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use archive::{ImmutableStorage, RetrievedObject};
pub use backend::{PutRequest, StoredObject, WormStore};
pub use filesystem::FilesystemWormStore;
pub use memory::MemoryWormStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object {key} is under retention until {retain_until}")]
    RetentionActive {
        key: String,
        retain_until: DateTime<Utc>,
    },

    #[error("Object {0} is under legal hold")]
    LegalHold(String),

    #[error("Integrity mismatch for {key}: expected {expected}, found {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
