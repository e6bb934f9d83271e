use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::entry::{now_micros, sha256_hex};
use crate::storage::backend::{validate_key, PutRequest, StoredObject, WormStore};
use crate::storage::StorageError;

const DATA_DIR: &str = "data";
const META_DIR: &str = "meta";

/// WORM store on a local directory.
///
/// Content lives under `data/<key>`, created exclusively and then made
/// read-only. Metadata lives in a JSON sidecar under `meta/<key>.json` and
/// is replaced atomically when a hold or retention date changes.
pub struct FilesystemWormStore {
    root: PathBuf,
    meta_lock: Mutex<()>,
}

impl FilesystemWormStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(DATA_DIR))?;
        std::fs::create_dir_all(root.join(META_DIR))?;
        info!("Opened filesystem WORM store at {}", root.display());
        Ok(Self {
            root,
            meta_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(DATA_DIR).join(key))
    }

    fn meta_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(META_DIR).join(format!("{}.json", key)))
    }

    async fn read_meta(&self, key: &str) -> Result<StoredObject, StorageError> {
        match tokio::fs::read(self.meta_path(key)?).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_meta(&self, object: &StoredObject) -> Result<(), StorageError> {
        let path = self.meta_path(&object.storage_key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec_pretty(object)?).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn write_content(&self, path: &Path, content: &[u8]) -> Result<(), std::io::Error> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);

        let mut permissions = tokio::fs::metadata(path).await?.permissions();
        permissions.set_readonly(true);
        tokio::fs::set_permissions(path, permissions).await
    }
}

#[async_trait]
impl WormStore for FilesystemWormStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn put(&self, request: PutRequest) -> Result<StoredObject, StorageError> {
        let data_path = self.data_path(&request.key)?;
        if let Some(parent) = data_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let _guard = self.meta_lock.lock().await;
        let (content, object) = request.into_object(uuid::Uuid::new_v4().to_string(), now_micros());

        match self.write_content(&data_path, &content).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if self.read_meta(&object.storage_key).await.is_ok() {
                    return Err(StorageError::AlreadyExists(object.storage_key));
                }
                // content from an earlier attempt that never got its sidecar
                let existing = tokio::fs::read(&data_path).await?;
                let actual = sha256_hex(&existing);
                if actual != object.content_hash {
                    return Err(StorageError::IntegrityMismatch {
                        key: object.storage_key,
                        expected: object.content_hash,
                        actual,
                    });
                }
                warn!("Recovering metadata for orphaned object {}", object.storage_key);
            }
            Err(e) => return Err(e.into()),
        }

        self.write_meta(&object).await?;
        debug!("Stored {} ({} bytes) on disk", object.storage_key, object.size);
        Ok(object)
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, StoredObject), StorageError> {
        let object = self.read_meta(key).await?;
        let content = match tokio::fs::read(self.data_path(key)?).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok((content, object))
    }

    async fn head(&self, key: &str) -> Result<StoredObject, StorageError> {
        self.read_meta(key).await
    }

    async fn set_legal_hold(&self, key: &str, hold: bool) -> Result<StoredObject, StorageError> {
        let _guard = self.meta_lock.lock().await;
        let mut object = self.read_meta(key).await?;
        object.legal_hold = hold;
        self.write_meta(&object).await?;
        Ok(object)
    }

    async fn extend_retention(
        &self,
        key: &str,
        until: DateTime<Utc>,
    ) -> Result<StoredObject, StorageError> {
        let _guard = self.meta_lock.lock().await;
        let mut object = self.read_meta(key).await?;
        object.extend_retention(until)?;
        self.write_meta(&object).await?;
        Ok(object)
    }

    #[allow(clippy::permissions_set_readonly_false)]
    async fn delete(&self, key: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        let _guard = self.meta_lock.lock().await;
        let object = self.read_meta(key).await?;
        object.ensure_deletable(now)?;

        let data_path = self.data_path(key)?;
        if let Ok(metadata) = tokio::fs::metadata(&data_path).await {
            let mut permissions = metadata.permissions();
            permissions.set_readonly(false);
            tokio::fs::set_permissions(&data_path, permissions).await?;
            tokio::fs::remove_file(&data_path).await?;
        }
        tokio::fs::remove_file(self.meta_path(key)?).await?;
        info!("Deleted expired object {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn request(key: &str, content: &[u8]) -> PutRequest {
        PutRequest {
            key: key.to_string(),
            content: content.to_vec(),
            content_type: "application/octet-stream".to_string(),
            content_hash: sha256_hex(content),
            retain_until: Utc::now() + chrono::Duration::days(1),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_put_is_write_once() {
        let dir = tempdir().unwrap();
        let store = FilesystemWormStore::new(dir.path()).unwrap();

        store.put(request("a/b.bin", b"first")).await.unwrap();
        let err = store.put(request("a/b.bin", b"second")).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        let (content, object) = store.get("a/b.bin").await.unwrap();
        assert_eq!(content, b"first");
        assert_eq!(object.size, 5);

        let permissions = std::fs::metadata(store.data_path("a/b.bin").unwrap())
            .unwrap()
            .permissions();
        assert!(permissions.readonly());
    }

    #[tokio::test]
    async fn test_orphaned_content_recovered() {
        let dir = tempdir().unwrap();
        let store = FilesystemWormStore::new(dir.path()).unwrap();
        std::fs::write(store.data_path("orphan.bin").unwrap(), b"payload").unwrap();

        let object = store.put(request("orphan.bin", b"payload")).await.unwrap();
        assert_eq!(object.content_hash, sha256_hex(b"payload"));

        std::fs::write(store.data_path("other.bin").unwrap(), b"junk").unwrap();
        let err = store.put(request("other.bin", b"payload")).await.unwrap_err();
        assert!(matches!(err, StorageError::IntegrityMismatch { .. }));
    }

    #[tokio::test]
    async fn test_hold_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FilesystemWormStore::new(dir.path()).unwrap();
            store.put(request("held.bin", b"x")).await.unwrap();
            store.set_legal_hold("held.bin", true).await.unwrap();
        }

        let store = FilesystemWormStore::new(dir.path()).unwrap();
        assert!(store.head("held.bin").await.unwrap().legal_hold);
        let far_future = Utc::now() + chrono::Duration::days(10);
        assert!(matches!(
            store.delete("held.bin", far_future).await,
            Err(StorageError::LegalHold(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_after_retention() {
        let dir = tempdir().unwrap();
        let store = FilesystemWormStore::new(dir.path()).unwrap();
        store.put(request("old.bin", b"x")).await.unwrap();

        assert!(matches!(
            store.delete("old.bin", Utc::now()).await,
            Err(StorageError::RetentionActive { .. })
        ));
        store
            .delete("old.bin", Utc::now() + chrono::Duration::days(2))
            .await
            .unwrap();
        assert!(matches!(
            store.head("old.bin").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempdir().unwrap();
        let store = FilesystemWormStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.put(request("../escape", b"x")).await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
