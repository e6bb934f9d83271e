//! Audit Chain Verification
//!
//! Recomputes hashes and linkage over recorded events. Breaks are reported
//! as data so that callers can bound forensic review.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::entry::{ChainHead, RecordedEvent, GENESIS_HASH};
use crate::crypto::hashes_equal;

/// Why a record failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// Stored hash does not match the recomputed hash.
    HashMismatch,
    /// `previous_hash` does not match the predecessor's hash.
    LinkMismatch,
    /// Sequence number is not exactly one more than the predecessor's.
    SequenceGap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBreak {
    pub index: usize,
    pub sequence_number: u64,
    pub kind: BreakKind,
    pub message: String,
}

/// First-break summary of a chain validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainValidation {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_at_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_at_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BreakKind>,
}

impl ChainValidation {
    fn valid() -> Self {
        Self {
            is_valid: true,
            invalid_at_sequence: None,
            invalid_at_index: None,
            reason: None,
        }
    }

    fn from_break(brk: &ChainBreak) -> Self {
        Self {
            is_valid: false,
            invalid_at_sequence: Some(brk.sequence_number),
            invalid_at_index: Some(brk.index),
            reason: Some(brk.kind),
        }
    }
}

/// Validate a chain segment, returning the first break.
///
/// The first record is only checked against genesis when it claims to be
/// sequence 1; use [`validate_chain_from`] to anchor any other segment.
pub fn validate_chain(records: &[RecordedEvent]) -> ChainValidation {
    validate_chain_from(records, None)
}

pub fn validate_chain_from(records: &[RecordedEvent], anchor: Option<&ChainHead>) -> ChainValidation {
    match scan(records, anchor, true).first() {
        Some(brk) => ChainValidation::from_break(brk),
        None => ChainValidation::valid(),
    }
}

/// Every break in the segment, in order.
pub fn find_chain_breaks(records: &[RecordedEvent], anchor: Option<&ChainHead>) -> Vec<ChainBreak> {
    scan(records, anchor, false)
}

fn scan(records: &[RecordedEvent], anchor: Option<&ChainHead>, stop_at_first: bool) -> Vec<ChainBreak> {
    let mut breaks = Vec::new();

    let genesis_anchor = ChainHead::genesis();
    let anchor = match (anchor, records.first()) {
        (Some(anchor), _) => Some(anchor),
        (None, Some(first)) if first.sequence_number == 1 => Some(&genesis_anchor),
        _ => None,
    };

    for (index, record) in records.iter().enumerate() {
        let predecessor = if index == 0 {
            anchor.cloned()
        } else {
            Some(records[index - 1].head())
        };

        if !record.verify_hash() {
            breaks.push(ChainBreak {
                index,
                sequence_number: record.sequence_number,
                kind: BreakKind::HashMismatch,
                message: format!(
                    "Invalid hash at sequence {}: stored {}, computed {}",
                    record.sequence_number,
                    record.event_hash,
                    record.calculate_hash()
                ),
            });
        } else if let Some(prev) = predecessor {
            if record.sequence_number != prev.sequence_number + 1 {
                breaks.push(ChainBreak {
                    index,
                    sequence_number: record.sequence_number,
                    kind: BreakKind::SequenceGap,
                    message: format!(
                        "Sequence gap at {}: expected {}",
                        record.sequence_number,
                        prev.sequence_number + 1
                    ),
                });
            } else if !hashes_equal(&record.previous_hash, &prev.event_hash) {
                breaks.push(ChainBreak {
                    index,
                    sequence_number: record.sequence_number,
                    kind: BreakKind::LinkMismatch,
                    message: format!(
                        "Hash chain broken at sequence {}: expected previous {}, got {}",
                        record.sequence_number, prev.event_hash, record.previous_hash
                    ),
                });
            }
        }

        if stop_at_first && !breaks.is_empty() {
            break;
        }
    }

    if breaks.is_empty() {
        debug!("Chain segment of {} records verified", records.len());
    } else {
        warn!(
            "Chain verification found {} break(s), first at sequence {}",
            breaks.len(),
            breaks[0].sequence_number
        );
    }

    breaks
}

/// Whether `head` is the genesis sentinel.
pub fn is_genesis_hash(hash: &str) -> bool {
    hashes_equal(hash, GENESIS_HASH)
}
