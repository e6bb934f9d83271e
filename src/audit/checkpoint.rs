//! Signed Checkpoints
//!
//! A checkpoint seals a contiguous range of events under one Merkle root
//! and one signature, and links back to the checkpoint before it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::entry::{canonical_timestamp, RecordedEvent};
use crate::audit::merkle::MerkleProof;
use crate::error::LedgerError;

pub const EXPORT_VERSION: &str = "1.0";

/// The signed summary of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointData {
    pub chain_id: String,
    pub checkpoint_number: u64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub first_sequence_number: u64,
    pub last_sequence_number: u64,
    pub event_count: u64,
    pub merkle_root: String,
    pub previous_checkpoint_id: Option<String>,
    pub previous_merkle_root: Option<String>,
}

impl CheckpointData {
    /// Bytes covered by the signature.
    pub fn canonical_string(&self) -> String {
        format!(
            "chain_id:{}|checkpoint_number:{}|period_start:{}|period_end:{}|first_sequence_number:{}|last_sequence_number:{}|event_count:{}|merkle_root:{}|previous_checkpoint_id:{}|previous_merkle_root:{}",
            serde_json::Value::String(self.chain_id.clone()),
            self.checkpoint_number,
            canonical_timestamp(&self.period_start),
            canonical_timestamp(&self.period_end),
            self.first_sequence_number,
            self.last_sequence_number,
            self.event_count,
            self.merkle_root,
            self.previous_checkpoint_id.as_deref().unwrap_or(""),
            self.previous_merkle_root.as_deref().unwrap_or("")
        )
    }

    /// `event_count == last - first + 1`.
    pub fn validate_range(&self) -> Result<(), LedgerError> {
        if self.last_sequence_number < self.first_sequence_number {
            return Err(LedgerError::chain_integrity(
                self.first_sequence_number,
                format!(
                    "Checkpoint {} range is inverted ({}..{})",
                    self.checkpoint_number, self.first_sequence_number, self.last_sequence_number
                ),
            ));
        }
        let expected = self.last_sequence_number - self.first_sequence_number + 1;
        if self.event_count != expected {
            return Err(LedgerError::chain_integrity(
                self.first_sequence_number,
                format!(
                    "Checkpoint {} covers {} sequences but claims {} events",
                    self.checkpoint_number, expected, self.event_count
                ),
            ));
        }
        Ok(())
    }

    pub fn covers(&self, sequence_number: u64) -> bool {
        (self.first_sequence_number..=self.last_sequence_number).contains(&sequence_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSignature {
    /// Base64 of the fixed-width `r || s` signature.
    pub signature: String,
    pub key_id: String,
    pub algorithm: String,
    pub signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    #[serde(flatten)]
    pub data: CheckpointData,
    pub signature: CheckpointSignature,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn summary(&self) -> String {
        format!(
            "Checkpoint {} [{}..{}] {} events, root: {}",
            self.data.checkpoint_number,
            self.data.first_sequence_number,
            self.data.last_sequence_number,
            self.data.event_count,
            self.data.merkle_root
        )
    }
}

/// Self-contained export of one checkpoint for regulators and WORM archives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointBundle {
    pub checkpoint: CheckpointData,
    pub signature: CheckpointSignature,
    pub public_key: String,
    pub events: Vec<RecordedEvent>,
    pub merkle_proofs: Vec<MerkleProof>,
    pub exported_at: DateTime<Utc>,
    pub export_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::parse_timestamp;

    fn sample() -> CheckpointData {
        CheckpointData {
            chain_id: "default".to_string(),
            checkpoint_number: 2,
            period_start: parse_timestamp("2025-03-01T00:00:00.000000Z").unwrap(),
            period_end: parse_timestamp("2025-03-01T01:00:00.000000Z").unwrap(),
            first_sequence_number: 1001,
            last_sequence_number: 2000,
            event_count: 1000,
            merkle_root: "ab".repeat(32),
            previous_checkpoint_id: Some("cp-1".to_string()),
            previous_merkle_root: Some("cd".repeat(32)),
        }
    }

    #[test]
    fn test_range_invariant() {
        let mut data = sample();
        assert!(data.validate_range().is_ok());
        assert!(data.covers(1001) && data.covers(2000) && !data.covers(2001));

        data.event_count = 999;
        assert!(data.validate_range().is_err());
    }

    #[test]
    fn test_canonical_string_includes_linkage() {
        let data = sample();
        let canonical = data.canonical_string();
        assert!(canonical.contains("previous_checkpoint_id:cp-1"));
        assert!(canonical.contains("first_sequence_number:1001"));

        let mut first = data.clone();
        first.previous_checkpoint_id = None;
        first.previous_merkle_root = None;
        assert_ne!(first.canonical_string(), canonical);
    }

    #[test]
    fn test_bundle_field_names() {
        let data = sample();
        let value = serde_json::to_value(&data).unwrap();
        assert!(value.get("checkpointNumber").is_some());
        assert!(value.get("previousMerkleRoot").is_some());
        assert!(value.get("periodStart").is_some());
    }
}
