use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::audit::checkpoint::{Checkpoint, CheckpointData, CheckpointSignature};
use crate::audit::entry::{parse_timestamp, RecordedEvent};
use crate::crypto::SigningKeyRecord;
use crate::error::LedgerError;

/// SQLite stores integers as i64.
pub fn to_db_int(value: u64) -> Result<i64, LedgerError> {
    i64::try_from(value)
        .map_err(|_| LedgerError::Database(format!("Value {} exceeds INTEGER range", value)))
}

pub fn from_db_int(value: i64, column: &str) -> Result<u64, LedgerError> {
    u64::try_from(value)
        .map_err(|_| LedgerError::Database(format!("Negative value {} in {}", value, column)))
}

fn parse_optional(value: Option<String>) -> Result<Option<DateTime<Utc>>, LedgerError> {
    value.as_deref().map(parse_timestamp).transpose()
}

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: String,
    pub chain_id: String,
    pub sequence_number: i64,
    pub timestamp: String,
    pub event_type: String,
    pub category: String,
    pub actor_id: Option<String>,
    pub actor_type: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub payload: String,
    pub previous_hash: String,
    pub event_hash: String,
    pub checkpoint_id: Option<String>,
    pub merkle_leaf_index: Option<i64>,
}

impl TryFrom<EventRow> for RecordedEvent {
    type Error = LedgerError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(RecordedEvent {
            id: row.id,
            chain_id: row.chain_id,
            sequence_number: from_db_int(row.sequence_number, "sequence_number")?,
            timestamp: parse_timestamp(&row.timestamp)?,
            event_type: row.event_type,
            category: row.category,
            actor_id: row.actor_id,
            actor_type: row.actor_type,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            payload: serde_json::from_str(&row.payload)?,
            previous_hash: row.previous_hash,
            event_hash: row.event_hash,
            checkpoint_id: row.checkpoint_id,
            merkle_leaf_index: row
                .merkle_leaf_index
                .map(|i| from_db_int(i, "merkle_leaf_index"))
                .transpose()?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CheckpointRow {
    pub id: String,
    pub chain_id: String,
    pub checkpoint_number: i64,
    pub period_start: String,
    pub period_end: String,
    pub first_sequence_number: i64,
    pub last_sequence_number: i64,
    pub event_count: i64,
    pub merkle_root: String,
    pub signature: String,
    pub key_id: String,
    pub algorithm: String,
    pub signed_at: String,
    pub previous_checkpoint_id: Option<String>,
    pub previous_merkle_root: Option<String>,
    pub created_at: String,
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = LedgerError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        Ok(Checkpoint {
            id: row.id,
            data: CheckpointData {
                chain_id: row.chain_id,
                checkpoint_number: from_db_int(row.checkpoint_number, "checkpoint_number")?,
                period_start: parse_timestamp(&row.period_start)?,
                period_end: parse_timestamp(&row.period_end)?,
                first_sequence_number: from_db_int(
                    row.first_sequence_number,
                    "first_sequence_number",
                )?,
                last_sequence_number: from_db_int(row.last_sequence_number, "last_sequence_number")?,
                event_count: from_db_int(row.event_count, "event_count")?,
                merkle_root: row.merkle_root,
                previous_checkpoint_id: row.previous_checkpoint_id,
                previous_merkle_root: row.previous_merkle_root,
            },
            signature: CheckpointSignature {
                signature: row.signature,
                key_id: row.key_id,
                algorithm: row.algorithm,
                signed_at: parse_timestamp(&row.signed_at)?,
            },
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SigningKeyRow {
    pub key_id: String,
    pub algorithm: String,
    pub public_key: String,
    pub created_at: String,
    pub rotated_at: Option<String>,
    pub expires_at: Option<String>,
    pub active: bool,
}

impl TryFrom<SigningKeyRow> for SigningKeyRecord {
    type Error = LedgerError;

    fn try_from(row: SigningKeyRow) -> Result<Self, Self::Error> {
        Ok(SigningKeyRecord {
            key_id: row.key_id,
            algorithm: row.algorithm,
            public_key: row.public_key,
            created_at: parse_timestamp(&row.created_at)?,
            rotated_at: parse_optional(row.rotated_at)?,
            expires_at: parse_optional(row.expires_at)?,
            active: row.active,
        })
    }
}

/// A successful copy of a checkpoint bundle into WORM storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointExport {
    pub checkpoint_id: String,
    pub storage_key: String,
    pub version_id: String,
    pub content_hash: String,
    pub retain_until: DateTime<Utc>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExportRow {
    pub checkpoint_id: String,
    pub storage_key: String,
    pub version_id: String,
    pub content_hash: String,
    pub retain_until: String,
    pub exported_at: String,
}

impl TryFrom<ExportRow> for CheckpointExport {
    type Error = LedgerError;

    fn try_from(row: ExportRow) -> Result<Self, Self::Error> {
        Ok(CheckpointExport {
            checkpoint_id: row.checkpoint_id,
            storage_key: row.storage_key,
            version_id: row.version_id,
            content_hash: row.content_hash,
            retain_until: parse_timestamp(&row.retain_until)?,
            exported_at: parse_timestamp(&row.exported_at)?,
        })
    }
}
