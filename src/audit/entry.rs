//! Audit Event Entries
//!
//! Defines recorded audit events and the deterministic hash that links
//! each event to its predecessor.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::LedgerError;

/// Previous hash of the first record in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Genesis sentinel used as `previous_hash` for sequence 1.
pub fn genesis() -> &'static str {
    GENESIS_HASH
}

/// An event submitted for recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_type: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            category: category.into(),
            actor_id: None,
            actor_type: None,
            resource_type: None,
            resource_id: None,
            payload: Value::Object(Default::default()),
        }
    }

    pub fn with_actor(mut self, actor_type: impl Into<String>, actor_id: impl Into<String>) -> Self {
        self.actor_type = Some(actor_type.into());
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// An event as persisted in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    pub id: String,
    pub chain_id: String,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub payload: Value,
    pub previous_hash: String,
    pub event_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_leaf_index: Option<u64>,
}

impl RecordedEvent {
    /// Recompute the hash from the stored fields.
    pub fn calculate_hash(&self) -> String {
        compute_record_hash(
            self.sequence_number,
            &self.timestamp,
            &self.event_type,
            &self.payload,
            &self.previous_hash,
        )
    }

    /// Verify this event's stored hash (constant time).
    pub fn verify_hash(&self) -> bool {
        crate::crypto::hashes_equal(&self.event_hash, &self.calculate_hash())
    }

    pub fn head(&self) -> ChainHead {
        ChainHead {
            sequence_number: self.sequence_number,
            event_hash: self.event_hash.clone(),
        }
    }
}

/// Last committed position of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainHead {
    pub sequence_number: u64,
    pub event_hash: String,
}

impl ChainHead {
    pub fn genesis() -> Self {
        Self {
            sequence_number: 0,
            event_hash: GENESIS_HASH.to_string(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence_number == 0
    }
}

/// Render a timestamp the way it is hashed and stored.
pub fn canonical_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::Serialization(format!("Invalid timestamp '{}': {}", value, e)))
}

/// Current time truncated to the precision that survives storage.
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Serialize JSON with object keys sorted at every depth and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash of one chain record.
pub fn compute_record_hash(
    sequence_number: u64,
    timestamp: &DateTime<Utc>,
    event_type: &str,
    payload: &Value,
    previous_hash: &str,
) -> String {
    // event_type is JSON-quoted so a '|' inside it cannot shift field boundaries
    let canonical = format!(
        "sequence_number:{}|timestamp:{}|event_type:{}|payload:{}|previous_hash:{}",
        sequence_number,
        canonical_timestamp(timestamp),
        Value::String(event_type.to_string()),
        canonical_json(payload),
        previous_hash
    );
    sha256_hex(canonical.as_bytes())
}

/// Chain `event` onto `head`, producing the next record.
pub fn link_event(
    chain_id: &str,
    head: &ChainHead,
    event: AuditEvent,
    id: String,
    timestamp: DateTime<Utc>,
) -> RecordedEvent {
    let sequence_number = head.sequence_number + 1;
    let event_hash = compute_record_hash(
        sequence_number,
        &timestamp,
        &event.event_type,
        &event.payload,
        &head.event_hash,
    );

    RecordedEvent {
        id,
        chain_id: chain_id.to_string(),
        sequence_number,
        timestamp,
        event_type: event.event_type,
        category: event.category,
        actor_id: event.actor_id,
        actor_type: event.actor_type,
        resource_type: event.resource_type,
        resource_id: event.resource_id,
        payload: event.payload,
        previous_hash: head.event_hash.clone(),
        event_hash,
        checkpoint_id: None,
        merkle_leaf_index: None,
    }
}
