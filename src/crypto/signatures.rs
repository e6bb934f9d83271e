use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::audit::checkpoint::{CheckpointData, CheckpointSignature};
use crate::audit::entry::{canonical_timestamp, now_micros};
use crate::crypto::key_management::{KeyStore, SigningKeyRecord};
use crate::error::LedgerError;

pub const SIGNATURE_ALGORITHM: &str = "ECDSA_P256_SHA256";

/// Result of checking a signature whose key may not be known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Valid,
    Invalid { reasons: Vec<String> },
    /// Verification could not run, e.g. the signing key is unknown.
    Unverifiable { reason: String },
}

impl VerificationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationOutcome::Valid)
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        VerificationOutcome::Invalid {
            reasons: vec![reason.into()],
        }
    }
}

/// `p256-` followed by 16 hex chars of the SHA-256 of the compressed key.
pub fn key_id_for(verifying_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(verifying_key.to_encoded_point(true).as_bytes());
    format!("p256-{}", &hex::encode(digest)[..16])
}

pub fn encode_public_key(verifying_key: &VerifyingKey) -> String {
    hex::encode(verifying_key.to_encoded_point(true).as_bytes())
}

pub fn decode_public_key(public_key: &str) -> Result<VerifyingKey, LedgerError> {
    let bytes = hex::decode(public_key)
        .map_err(|e| LedgerError::Signing(format!("Invalid public key hex: {}", e)))?;
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| LedgerError::Signing(format!("Invalid public key: {}", e)))
}

/// Message actually signed: the checkpoint summary bound to key and time.
fn signing_message(data: &CheckpointData, key_id: &str, signed_at: &DateTime<Utc>) -> String {
    format!(
        "{}|key_id:{}|signed_at:{}",
        data.canonical_string(),
        key_id,
        canonical_timestamp(signed_at)
    )
}

/// Cryptographic check of `signature` against `public_key`, ignoring key
/// lifecycle. Fails closed on any decoding problem.
pub fn verify_signature_bytes(
    data: &CheckpointData,
    signature: &CheckpointSignature,
    public_key: &str,
) -> bool {
    if signature.algorithm != SIGNATURE_ALGORITHM {
        return false;
    }
    let Ok(verifying_key) = decode_public_key(public_key) else {
        return false;
    };
    let Ok(raw) = BASE64.decode(&signature.signature) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&raw) else {
        return false;
    };
    let message = signing_message(data, &signature.key_id, &signature.signed_at);
    verifying_key.verify(message.as_bytes(), &sig).is_ok()
}

struct KeyEntry {
    record: SigningKeyRecord,
    /// Dropped once the key is rotated out.
    signing_key: Option<SigningKey>,
}

#[derive(Default)]
struct Keyring {
    keys: HashMap<String, KeyEntry>,
    active: Option<String>,
}

/// Signs checkpoint summaries and keeps every key needed to verify them.
pub struct Signer {
    keyring: RwLock<Keyring>,
    retention: chrono::Duration,
    store: Option<KeyStore>,
}

impl Signer {
    /// Signer with a fresh in-memory key.
    pub fn generate(retention_days: i64) -> Self {
        Self::from_signing_key(SigningKey::random(&mut rand::rngs::OsRng), retention_days)
    }

    pub fn from_signing_key(signing_key: SigningKey, retention_days: i64) -> Self {
        let record = new_record(&signing_key, now_micros());
        let key_id = record.key_id.clone();
        let mut keyring = Keyring::default();
        keyring.keys.insert(
            key_id.clone(),
            KeyEntry {
                record,
                signing_key: Some(signing_key),
            },
        );
        keyring.active = Some(key_id);

        Self {
            keyring: RwLock::new(keyring),
            retention: chrono::Duration::days(retention_days),
            store: None,
        }
    }

    /// Signer backed by an on-disk key store. Rotations are written back to it.
    pub fn from_key_store(store: KeyStore, retention_days: i64) -> Result<Self, LedgerError> {
        let (stored, active) = store.load_or_create()?;
        let mut keyring = Keyring::default();

        for key in stored {
            let is_active = key.key_id == active;
            let mut record = new_record(&key.signing_key, key.created_at);
            record.active = is_active;
            keyring.keys.insert(
                key.key_id,
                KeyEntry {
                    record,
                    signing_key: is_active.then_some(key.signing_key),
                },
            );
        }
        keyring.active = Some(active.clone());

        info!(
            "Loaded {} signing key(s) from {}, active: {}",
            keyring.keys.len(),
            store.dir().display(),
            active
        );

        Ok(Self {
            keyring: RwLock::new(keyring),
            retention: chrono::Duration::days(retention_days),
            store: Some(store),
        })
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    pub async fn active_key_id(&self) -> Option<String> {
        self.keyring.read().await.active.clone()
    }

    pub async fn active_key(&self) -> Result<SigningKeyRecord, LedgerError> {
        let keyring = self.keyring.read().await;
        keyring
            .active
            .as_ref()
            .and_then(|id| keyring.keys.get(id))
            .map(|entry| entry.record.clone())
            .ok_or_else(|| LedgerError::Signing("No active signing key".to_string()))
    }

    pub async fn key_record(&self, key_id: &str) -> Option<SigningKeyRecord> {
        self.keyring
            .read()
            .await
            .keys
            .get(key_id)
            .map(|entry| entry.record.clone())
    }

    pub async fn key_records(&self) -> Vec<SigningKeyRecord> {
        let keyring = self.keyring.read().await;
        let mut records: Vec<SigningKeyRecord> =
            keyring.keys.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Sign a checkpoint summary with the active key.
    pub async fn sign(&self, data: &CheckpointData) -> Result<CheckpointSignature, LedgerError> {
        let keyring = self.keyring.read().await;
        let key_id = keyring
            .active
            .as_ref()
            .ok_or_else(|| LedgerError::Signing("No active signing key".to_string()))?;
        let signing_key = keyring
            .keys
            .get(key_id)
            .and_then(|entry| entry.signing_key.as_ref())
            .ok_or_else(|| {
                LedgerError::Signing(format!("Private key for {} is unavailable", key_id))
            })?;

        let signed_at = now_micros();
        let message = signing_message(data, key_id, &signed_at);
        let signature: Signature = signing_key
            .try_sign(message.as_bytes())
            .map_err(|e| LedgerError::Signing(format!("Signature creation failed: {}", e)))?;

        debug!(
            "Signed checkpoint {} with {}",
            data.checkpoint_number, key_id
        );

        Ok(CheckpointSignature {
            signature: BASE64.encode(signature.to_bytes()),
            key_id: key_id.clone(),
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            signed_at,
        })
    }

    /// Verify against an explicit key record. Fails closed.
    pub fn verify(
        data: &CheckpointData,
        signature: &CheckpointSignature,
        key: &SigningKeyRecord,
    ) -> bool {
        if key.algorithm != signature.algorithm || key.key_id != signature.key_id {
            return false;
        }
        if !key.accepts_signature_at(signature.signed_at, Utc::now()) {
            return false;
        }
        verify_signature_bytes(data, signature, &key.public_key)
    }

    /// Verify using whichever known key the signature names.
    pub async fn verify_with_keyring(
        &self,
        data: &CheckpointData,
        signature: &CheckpointSignature,
    ) -> VerificationOutcome {
        let Some(key) = self.key_record(&signature.key_id).await else {
            return VerificationOutcome::Unverifiable {
                reason: format!("Unknown signing key {}", signature.key_id),
            };
        };

        if key.algorithm != signature.algorithm {
            return VerificationOutcome::invalid(format!(
                "Algorithm mismatch: key uses {}, signature claims {}",
                key.algorithm, signature.algorithm
            ));
        }
        if !key.accepts_signature_at(signature.signed_at, Utc::now()) {
            return VerificationOutcome::invalid(format!(
                "Signature time {} outside validity window of key {}",
                signature.signed_at, key.key_id
            ));
        }
        if !verify_signature_bytes(data, signature, &key.public_key) {
            return VerificationOutcome::invalid("Signature does not match checkpoint data");
        }
        VerificationOutcome::Valid
    }

    /// Replace the active key. The old key stays available for verification
    /// for the retention horizon; its private half is discarded.
    pub async fn rotate_key(&self) -> Result<String, LedgerError> {
        let mut keyring = self.keyring.write().await;
        let new_key = SigningKey::random(&mut rand::rngs::OsRng);

        if let Some(store) = &self.store {
            store.save_key(&new_key)?;
        }

        let now = now_micros();
        let record = new_record(&new_key, now);
        let new_id = record.key_id.clone();

        if let Some(store) = &self.store {
            store.set_active(&new_id)?;
        }

        if let Some(old_id) = keyring.active.take() {
            if let Some(entry) = keyring.keys.get_mut(&old_id) {
                entry.record.retire(now, self.retention);
                entry.signing_key = None;
            }
            info!("Rotated signing key {} -> {}", old_id, new_id);
        }

        keyring.keys.insert(
            new_id.clone(),
            KeyEntry {
                record,
                signing_key: Some(new_key),
            },
        );
        keyring.active = Some(new_id.clone());
        Ok(new_id)
    }

    /// Adopt persisted metadata for a known key, or add a verify-only key.
    ///
    /// Persisted lifecycle wins over local metadata, except that a key the
    /// local store considers active is never downgraded by a stale record.
    pub async fn import_key_record(&self, record: SigningKeyRecord) -> Result<(), LedgerError> {
        let verifying_key = decode_public_key(&record.public_key)?;
        if key_id_for(&verifying_key) != record.key_id {
            return Err(LedgerError::Signing(format!(
                "Key id {} does not match its public key",
                record.key_id
            )));
        }

        let mut keyring = self.keyring.write().await;
        let is_local_active = keyring.active.as_deref() == Some(record.key_id.as_str());
        match keyring.keys.get_mut(&record.key_id) {
            Some(entry) => {
                if is_local_active && !record.active {
                    warn!(
                        "Persisted record marks active key {} as rotated; keeping local state",
                        record.key_id
                    );
                    entry.record.created_at = record.created_at;
                } else {
                    entry.record = record;
                }
            }
            None => {
                debug!("Imported verify-only key {}", record.key_id);
                keyring.keys.insert(
                    record.key_id.clone(),
                    KeyEntry {
                        record,
                        signing_key: None,
                    },
                );
            }
        }
        Ok(())
    }
}

fn new_record(signing_key: &SigningKey, created_at: DateTime<Utc>) -> SigningKeyRecord {
    let verifying_key = signing_key.verifying_key();
    SigningKeyRecord {
        key_id: key_id_for(verifying_key),
        algorithm: SIGNATURE_ALGORITHM.to_string(),
        public_key: encode_public_key(verifying_key),
        created_at,
        rotated_at: None,
        expires_at: None,
        active: true,
    }
}
