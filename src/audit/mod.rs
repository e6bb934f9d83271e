//! Audit Trail
//!
//! Tamper-evident event recording: a SHA-256 hash chain over events,
//! sealed periodically into signed Merkle checkpoints.

pub mod bundle;
pub mod checkpoint;
pub mod entry;
pub mod merkle;
pub mod verify;
pub mod writer;

pub use bundle::{verify_bundle, BundleVerification};
pub use checkpoint::{Checkpoint, CheckpointBundle, CheckpointData, CheckpointSignature};
pub use entry::{AuditEvent, ChainHead, RecordedEvent, GENESIS_HASH};
pub use merkle::{verify_proof, MerkleProof, MerkleTree};
pub use verify::{find_chain_breaks, validate_chain, validate_chain_from, ChainValidation};
pub use writer::{
    AuditStats, AuditWriter, ChainVerification, CheckpointVerification, EventProof, WriterPhase,
};
