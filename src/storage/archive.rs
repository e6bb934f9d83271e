//! Immutable archive of checkpoint bundles and evidence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::audit::checkpoint::CheckpointBundle;
use crate::audit::entry::{now_micros, sha256_hex};
use crate::config::{StorageBackendKind, StorageConfig};
use crate::crypto::hashes_equal;
use crate::storage::backend::{validate_key, PutRequest, StoredObject, WormStore};
use crate::storage::filesystem::FilesystemWormStore;
use crate::storage::memory::MemoryWormStore;
use crate::storage::StorageError;

const BUNDLE_CONTENT_TYPE: &str = "application/json";
const KEY_HASH_PREFIX: usize = 16;

/// Content read back from the archive together with its integrity check.
#[derive(Debug, Clone)]
pub struct RetrievedObject {
    pub content: Vec<u8>,
    pub storage: StoredObject,
    /// Whether the content still hashes to the hash recorded at write time.
    pub integrity_verified: bool,
}

pub struct ImmutableStorage {
    store: Arc<dyn WormStore>,
    retention: chrono::Duration,
}

impl ImmutableStorage {
    pub fn new(store: Arc<dyn WormStore>, retention_days: i64) -> Self {
        Self {
            store,
            retention: chrono::Duration::days(retention_days),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let store: Arc<dyn WormStore> = match config.backend {
            StorageBackendKind::Memory => Arc::new(MemoryWormStore::new()),
            StorageBackendKind::Filesystem => Arc::new(FilesystemWormStore::new(&config.root_path)?),
        };
        Ok(Self::new(store, config.retention_days))
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn checkpoint_key(chain_id: &str, checkpoint_number: u64, content_hash: &str) -> String {
        format!(
            "checkpoints/{}/{:010}-{}.json",
            chain_id,
            checkpoint_number,
            &content_hash[..KEY_HASH_PREFIX.min(content_hash.len())]
        )
    }

    pub fn evidence_key(evidence_id: &str, content_hash: &str) -> String {
        format!(
            "evidence/{}/{}",
            evidence_id,
            &content_hash[..KEY_HASH_PREFIX.min(content_hash.len())]
        )
    }

    /// Write a checkpoint bundle under a retention lock.
    pub async fn store_checkpoint(
        &self,
        checkpoint_number: u64,
        bundle: &CheckpointBundle,
    ) -> Result<StoredObject, StorageError> {
        if bundle.checkpoint.checkpoint_number != checkpoint_number {
            return Err(StorageError::InvalidKey(format!(
                "bundle holds checkpoint {}, not {}",
                bundle.checkpoint.checkpoint_number, checkpoint_number
            )));
        }

        let content = serde_json::to_vec_pretty(bundle)?;
        let content_hash = sha256_hex(&content);
        let key = Self::checkpoint_key(&bundle.checkpoint.chain_id, checkpoint_number, &content_hash);

        let mut metadata = BTreeMap::new();
        metadata.insert("chainId".to_string(), bundle.checkpoint.chain_id.clone());
        metadata.insert("checkpointNumber".to_string(), checkpoint_number.to_string());
        metadata.insert("merkleRoot".to_string(), bundle.checkpoint.merkle_root.clone());
        metadata.insert("keyId".to_string(), bundle.signature.key_id.clone());

        self.put_once(key, content, content_hash, BUNDLE_CONTENT_TYPE, metadata)
            .await
    }

    pub async fn store_evidence(
        &self,
        evidence_id: &str,
        content: &[u8],
        content_type: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<StoredObject, StorageError> {
        let content_hash = sha256_hex(content);
        let key = Self::evidence_key(evidence_id, &content_hash);
        self.put_once(key, content.to_vec(), content_hash, content_type, metadata)
            .await
    }

    /// Write once. A retry of identical content resolves to the object the
    /// first attempt stored; different content under the same key fails.
    async fn put_once(
        &self,
        key: String,
        content: Vec<u8>,
        content_hash: String,
        content_type: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<StoredObject, StorageError> {
        validate_key(&key)?;
        let request = PutRequest {
            key: key.clone(),
            content,
            content_type: content_type.to_string(),
            content_hash: content_hash.clone(),
            retain_until: now_micros() + self.retention,
            metadata,
        };

        match self.store.put(request).await {
            Ok(object) => {
                info!(
                    "Stored {} in {} WORM store, retained until {}",
                    object.storage_key,
                    self.store.name(),
                    object.retain_until
                );
                Ok(object)
            }
            Err(StorageError::AlreadyExists(_)) => {
                let existing = self.store.head(&key).await?;
                if hashes_equal(&existing.content_hash, &content_hash) {
                    debug!("{} already stored with identical content", key);
                    Ok(existing)
                } else {
                    Err(StorageError::IntegrityMismatch {
                        key,
                        expected: content_hash,
                        actual: existing.content_hash,
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Read an object and recompute its content hash.
    pub async fn retrieve(&self, key: &str) -> Result<RetrievedObject, StorageError> {
        let (content, storage) = self.store.get(key).await?;
        let integrity_verified = hashes_equal(&sha256_hex(&content), &storage.content_hash);
        if !integrity_verified {
            warn!("Integrity check failed for stored object {}", key);
        }
        Ok(RetrievedObject {
            content,
            storage,
            integrity_verified,
        })
    }

    /// Read and parse a checkpoint bundle. Tampered content is an error.
    pub async fn retrieve_checkpoint(&self, key: &str) -> Result<CheckpointBundle, StorageError> {
        let retrieved = self.retrieve(key).await?;
        if !retrieved.integrity_verified {
            return Err(StorageError::IntegrityMismatch {
                key: key.to_string(),
                expected: retrieved.storage.content_hash,
                actual: sha256_hex(&retrieved.content),
            });
        }
        Ok(serde_json::from_slice(&retrieved.content)?)
    }

    pub async fn head(&self, key: &str) -> Result<StoredObject, StorageError> {
        self.store.head(key).await
    }

    pub async fn apply_legal_hold(&self, key: &str) -> Result<StoredObject, StorageError> {
        let object = self.store.set_legal_hold(key, true).await?;
        info!("Legal hold applied to {}", key);
        Ok(object)
    }

    pub async fn release_legal_hold(&self, key: &str) -> Result<StoredObject, StorageError> {
        let object = self.store.set_legal_hold(key, false).await?;
        info!("Legal hold released on {}", key);
        Ok(object)
    }

    pub async fn get_legal_hold_status(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.store.head(key).await?.legal_hold)
    }

    pub async fn extend_retention(
        &self,
        key: &str,
        until: DateTime<Utc>,
    ) -> Result<StoredObject, StorageError> {
        let object = self.store.extend_retention(key, until).await?;
        info!("Retention of {} extended to {}", key, object.retain_until);
        Ok(object)
    }

    /// Delete an object whose retention has lapsed and which is not held.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.store.delete(key, Utc::now()).await
    }
}
