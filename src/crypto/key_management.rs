//! Signing Key Management
//!
//! Key lifecycle records and the on-disk key store holding the private
//! halves of checkpoint signing keys.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use p256::ecdsa::SigningKey;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::entry::now_micros;
use crate::crypto::signatures::key_id_for;
use crate::error::LedgerError;

const ACTIVE_MARKER: &str = "ACTIVE";
const KEY_EXTENSION: &str = "pem";

/// Key status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Signs new checkpoints.
    Active,
    /// Rotated out; verifies historical signatures until it expires.
    Retired,
    /// Past its retention horizon.
    Expired,
}

/// Public metadata of a signing key, persisted alongside checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningKeyRecord {
    pub key_id: String,
    pub algorithm: String,
    /// SEC1 compressed point, hex.
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl SigningKeyRecord {
    pub fn status_at(&self, now: DateTime<Utc>) -> KeyStatus {
        match self.expires_at {
            Some(expires_at) if now > expires_at => KeyStatus::Expired,
            _ if self.active => KeyStatus::Active,
            _ => KeyStatus::Retired,
        }
    }

    /// Whether a signature made at `signed_at` may be accepted at `now`.
    pub fn accepts_signature_at(&self, signed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if signed_at < self.created_at {
            return false;
        }
        if let Some(rotated_at) = self.rotated_at {
            if signed_at > rotated_at {
                return false;
            }
        }
        self.status_at(now) != KeyStatus::Expired
    }

    /// Mark the key as rotated out, retained for `retention`.
    pub fn retire(&mut self, at: DateTime<Utc>, retention: chrono::Duration) {
        self.active = false;
        self.rotated_at = Some(at);
        self.expires_at = Some(at + retention);
    }
}

/// Directory of PKCS#8 PEM private keys named `<key_id>.pem`, with an
/// `ACTIVE` file naming the key that signs new checkpoints.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

/// A private key loaded from the store.
pub struct StoredKey {
    pub key_id: String,
    pub signing_key: SigningKey,
    pub created_at: DateTime<Utc>,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every key, generating the first one if the store is empty.
    /// Returns the keys and the id of the active key.
    pub fn load_or_create(&self) -> Result<(Vec<StoredKey>, String), LedgerError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            LedgerError::Configuration(format!(
                "Failed to create key directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut keys = self.load_all()?;
        if keys.is_empty() {
            info!("Key store {} is empty, generating signing key", self.dir.display());
            let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
            let key_id = self.save_key(&signing_key)?;
            self.set_active(&key_id)?;
            keys.push(StoredKey {
                key_id,
                signing_key,
                created_at: now_micros(),
            });
        }

        let active = match self.active_key_id()? {
            Some(id) if keys.iter().any(|k| k.key_id == id) => id,
            Some(id) => {
                return Err(LedgerError::Configuration(format!(
                    "Active key {} not found in {}",
                    id,
                    self.dir.display()
                )))
            }
            None if keys.len() == 1 => {
                let id = keys[0].key_id.clone();
                self.set_active(&id)?;
                id
            }
            None => {
                return Err(LedgerError::Configuration(format!(
                    "Key store {} holds {} keys but no {} marker",
                    self.dir.display(),
                    keys.len(),
                    ACTIVE_MARKER
                )))
            }
        };

        Ok((keys, active))
    }

    fn load_all(&self) -> Result<Vec<StoredKey>, LedgerError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            LedgerError::Configuration(format!("Failed to read key directory: {}", e))
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                LedgerError::Configuration(format!("Failed to read key directory: {}", e))
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_EXTENSION) {
                continue;
            }

            let pem = fs::read_to_string(&path).map_err(|e| {
                LedgerError::Signing(format!("Failed to read key {}: {}", path.display(), e))
            })?;
            let signing_key = SigningKey::from_pkcs8_pem(&pem).map_err(|e| {
                LedgerError::Signing(format!("Invalid private key {}: {}", path.display(), e))
            })?;

            let key_id = key_id_for(signing_key.verifying_key());
            let file_stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if file_stem != key_id {
                warn!(
                    "Key file {} does not match its key id {}",
                    path.display(),
                    key_id
                );
            }

            let created_at = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .ok()
                .and_then(|t| DateTime::from_timestamp_micros(t.timestamp_micros()))
                .unwrap_or_else(now_micros);

            debug!("Loaded signing key {}", key_id);
            keys.push(StoredKey {
                key_id,
                signing_key,
                created_at,
            });
        }

        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    /// Write a private key; existing key files are never overwritten.
    pub fn save_key(&self, signing_key: &SigningKey) -> Result<String, LedgerError> {
        let key_id = key_id_for(signing_key.verifying_key());
        let path = self.dir.join(format!("{}.{}", key_id, KEY_EXTENSION));
        let pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| LedgerError::Signing(format!("Failed to encode private key: {}", e)))?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        use std::io::Write;
        let mut file = options.open(&path).map_err(|e| {
            LedgerError::Signing(format!("Failed to create key file {}: {}", path.display(), e))
        })?;
        file.write_all(pem.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| LedgerError::Signing(format!("Failed to write key file: {}", e)))?;

        info!("Stored signing key {} in {}", key_id, self.dir.display());
        Ok(key_id)
    }

    pub fn set_active(&self, key_id: &str) -> Result<(), LedgerError> {
        let marker = self.dir.join(ACTIVE_MARKER);
        let staging = self.dir.join(format!("{}.tmp", ACTIVE_MARKER));
        fs::write(&staging, key_id)
            .and_then(|_| fs::rename(&staging, &marker))
            .map_err(|e| LedgerError::Signing(format!("Failed to update active key marker: {}", e)))
    }

    pub fn active_key_id(&self) -> Result<Option<String>, LedgerError> {
        let marker = self.dir.join(ACTIVE_MARKER);
        if !marker.exists() {
            return Ok(None);
        }
        let id = fs::read_to_string(&marker)
            .map_err(|e| LedgerError::Signing(format!("Failed to read active key marker: {}", e)))?;
        Ok(Some(id.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record() -> SigningKeyRecord {
        SigningKeyRecord {
            key_id: "p256-test".to_string(),
            algorithm: "ECDSA_P256_SHA256".to_string(),
            public_key: "02ab".to_string(),
            created_at: now_micros() - chrono::Duration::days(10),
            rotated_at: None,
            expires_at: None,
            active: true,
        }
    }

    #[test]
    fn test_validity_window() {
        let mut key = record();
        let now = now_micros();
        let before_creation = key.created_at - chrono::Duration::seconds(1);
        assert!(key.accepts_signature_at(now, now));
        assert!(!key.accepts_signature_at(before_creation, now));

        let rotation = now - chrono::Duration::days(1);
        key.retire(rotation, chrono::Duration::days(2555));
        assert_eq!(key.status_at(now), KeyStatus::Retired);
        assert!(key.accepts_signature_at(rotation - chrono::Duration::days(2), now));
        assert!(!key.accepts_signature_at(now, now));

        let far_future = now + chrono::Duration::days(3000);
        assert_eq!(key.status_at(far_future), KeyStatus::Expired);
        assert!(!key.accepts_signature_at(rotation - chrono::Duration::days(2), far_future));
    }

    #[test]
    fn test_key_store_generates_and_reloads() {
        let dir = tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys"));

        let (keys, active) = store.load_or_create().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_id, active);

        let (reloaded, reloaded_active) = store.load_or_create().unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded_active, active);
        assert_eq!(
            reloaded[0].signing_key.verifying_key(),
            keys[0].signing_key.verifying_key()
        );
    }

    #[test]
    fn test_key_files_are_write_once() {
        let dir = tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        store.save_key(&key).unwrap();
        assert!(matches!(store.save_key(&key), Err(LedgerError::Signing(_))));
    }
}
