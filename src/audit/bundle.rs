//! Offline verification of exported checkpoint bundles.
//!
//! A bundle carries everything needed to check it: the events, their
//! inclusion proofs, the signed summary and the signer's public key. The
//! signing key's lifecycle is not checked here because a bundle does not
//! carry key records.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::checkpoint::{CheckpointBundle, EXPORT_VERSION};
use crate::audit::merkle::{merkle_root, verify_proof};
use crate::audit::verify::{find_chain_breaks, is_genesis_hash};
use crate::crypto::hashes_equal;
use crate::crypto::signatures::{decode_public_key, key_id_for, verify_signature_bytes};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleVerification {
    pub is_valid: bool,
    pub checkpoint_number: u64,
    pub events_checked: usize,
    pub proofs_checked: usize,
    pub issues: Vec<String>,
}

/// Check every part of a bundle and report all problems found.
pub fn verify_bundle(bundle: &CheckpointBundle) -> BundleVerification {
    let checkpoint = &bundle.checkpoint;
    let mut issues = Vec::new();

    if bundle.export_version != EXPORT_VERSION {
        issues.push(format!(
            "Unsupported export version {}, expected {}",
            bundle.export_version, EXPORT_VERSION
        ));
    }

    if let Err(e) = checkpoint.validate_range() {
        issues.push(e.to_string());
    }

    if bundle.events.len() as u64 != checkpoint.event_count {
        issues.push(format!(
            "Bundle carries {} events but checkpoint claims {}",
            bundle.events.len(),
            checkpoint.event_count
        ));
    }

    match (bundle.events.first(), bundle.events.last()) {
        (Some(first), Some(last)) => {
            if first.sequence_number != checkpoint.first_sequence_number
                || last.sequence_number != checkpoint.last_sequence_number
            {
                issues.push(format!(
                    "Events span {}..{} but checkpoint covers {}..{}",
                    first.sequence_number,
                    last.sequence_number,
                    checkpoint.first_sequence_number,
                    checkpoint.last_sequence_number
                ));
            }
            if first.sequence_number != 1 && is_genesis_hash(&first.previous_hash) {
                issues.push(format!(
                    "Event {} links to genesis but is not the first event",
                    first.sequence_number
                ));
            }
        }
        _ => issues.push("Bundle carries no events".to_string()),
    }

    for event in &bundle.events {
        if event.chain_id != checkpoint.chain_id {
            issues.push(format!(
                "Event {} belongs to chain {}",
                event.sequence_number, event.chain_id
            ));
        }
    }

    for brk in find_chain_breaks(&bundle.events, None) {
        issues.push(brk.message);
    }

    let leaves: Vec<String> = bundle.events.iter().map(|e| e.event_hash.clone()).collect();
    if !leaves.is_empty() {
        match merkle_root(&leaves) {
            Ok(root) if hashes_equal(&root, &checkpoint.merkle_root) => {}
            Ok(root) => issues.push(format!(
                "Merkle root mismatch: computed {}, checkpoint has {}",
                root, checkpoint.merkle_root
            )),
            Err(e) => issues.push(e.to_string()),
        }
    }

    if bundle.merkle_proofs.len() != bundle.events.len() {
        issues.push(format!(
            "Bundle carries {} proofs for {} events",
            bundle.merkle_proofs.len(),
            bundle.events.len()
        ));
    }
    for (index, proof) in bundle.merkle_proofs.iter().enumerate() {
        if proof.leaf_index != index as u64 {
            issues.push(format!(
                "Proof {} is for leaf {}",
                index, proof.leaf_index
            ));
        }
        if let Some(event) = bundle.events.get(index) {
            if !hashes_equal(&proof.leaf_hash, &event.event_hash) {
                issues.push(format!(
                    "Proof {} does not prove event {}",
                    index, event.sequence_number
                ));
            }
        }
        if !verify_proof(proof, &checkpoint.merkle_root) {
            issues.push(format!("Proof for leaf {} does not reach the root", proof.leaf_index));
        }
    }

    match decode_public_key(&bundle.public_key) {
        Ok(verifying_key) => {
            let fingerprint = key_id_for(&verifying_key);
            if fingerprint != bundle.signature.key_id {
                issues.push(format!(
                    "Public key fingerprint {} does not match signing key id {}",
                    fingerprint, bundle.signature.key_id
                ));
            }
        }
        Err(e) => issues.push(e.to_string()),
    }

    if !verify_signature_bytes(checkpoint, &bundle.signature, &bundle.public_key) {
        issues.push("Checkpoint signature is invalid".to_string());
    }

    let result = BundleVerification {
        is_valid: issues.is_empty(),
        checkpoint_number: checkpoint.checkpoint_number,
        events_checked: bundle.events.len(),
        proofs_checked: bundle.merkle_proofs.len(),
        issues,
    };

    if result.is_valid {
        info!(
            "Bundle for checkpoint {} verified ({} events)",
            result.checkpoint_number, result.events_checked
        );
    } else {
        warn!(
            "Bundle for checkpoint {} has {} issue(s)",
            result.checkpoint_number,
            result.issues.len()
        );
    }
    result
}
