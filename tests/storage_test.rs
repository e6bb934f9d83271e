//! WORM storage tests for both backends

mod common;
use common::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use audit_ledger::storage::{
    FilesystemWormStore, ImmutableStorage, MemoryWormStore, PutRequest, StorageError, WormStore,
};
use chrono::{Duration, Utc};
use tempfile::tempdir;

fn put_request(key: &str, content: &[u8]) -> PutRequest {
    PutRequest {
        key: key.to_string(),
        content: content.to_vec(),
        content_type: "text/plain".to_string(),
        content_hash: audit_ledger::audit::entry::sha256_hex(content),
        retain_until: Utc::now() + Duration::days(30),
        metadata: BTreeMap::new(),
    }
}

async fn assert_worm_semantics(store: Arc<dyn WormStore>) {
    store.put(put_request("evidence/a/1", b"first")).await.unwrap();

    // an existing key is never overwritten
    assert!(matches!(
        store.put(put_request("evidence/a/1", b"second")).await,
        Err(StorageError::AlreadyExists(_))
    ));
    let (content, _) = store.get("evidence/a/1").await.unwrap();
    assert_eq!(content, b"first");

    assert!(matches!(
        store.delete("evidence/a/1", Utc::now()).await,
        Err(StorageError::RetentionActive { .. })
    ));

    let held = store.set_legal_hold("evidence/a/1", true).await.unwrap();
    assert!(held.legal_hold);
    let after_retention = Utc::now() + Duration::days(31);
    assert!(matches!(
        store.delete("evidence/a/1", after_retention).await,
        Err(StorageError::LegalHold(_))
    ));

    store.set_legal_hold("evidence/a/1", false).await.unwrap();
    store.delete("evidence/a/1", after_retention).await.unwrap();
    assert!(matches!(
        store.head("evidence/a/1").await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_memory_store_is_write_once() {
    assert_worm_semantics(Arc::new(MemoryWormStore::new())).await;
}

#[tokio::test]
async fn test_filesystem_store_is_write_once() {
    let dir = tempdir().unwrap();
    assert_worm_semantics(Arc::new(FilesystemWormStore::new(dir.path()).unwrap())).await;
}

#[tokio::test]
async fn test_delete_rejected_under_retention() {
    let storage = ImmutableStorage::new(Arc::new(MemoryWormStore::new()), RETENTION_DAYS);
    let object = storage
        .store_evidence("ev-1", b"scan output", "text/plain", BTreeMap::new())
        .await
        .unwrap();

    match storage.delete(&object.storage_key).await {
        Err(StorageError::RetentionActive { retain_until, .. }) => {
            assert_eq!(retain_until, object.retain_until);
            assert!(retain_until > Utc::now() + Duration::days(RETENTION_DAYS - 1));
        }
        other => panic!("expected retention error, got {:?}", other),
    }
    assert!(storage.retrieve(&object.storage_key).await.unwrap().integrity_verified);
}

#[tokio::test]
async fn test_legal_hold_status() {
    let storage = ImmutableStorage::new(Arc::new(MemoryWormStore::new()), RETENTION_DAYS);
    let object = storage
        .store_evidence("ev-2", b"policy.pdf", "application/pdf", BTreeMap::new())
        .await
        .unwrap();

    assert!(!storage.get_legal_hold_status(&object.storage_key).await.unwrap());
    storage.apply_legal_hold(&object.storage_key).await.unwrap();
    assert!(storage.get_legal_hold_status(&object.storage_key).await.unwrap());
    storage.release_legal_hold(&object.storage_key).await.unwrap();
    assert!(!storage.get_legal_hold_status(&object.storage_key).await.unwrap());
}

#[tokio::test]
async fn test_retention_only_moves_forward() {
    let storage = ImmutableStorage::new(Arc::new(MemoryWormStore::new()), 30);
    let object = storage
        .store_evidence("ev-3", b"report", "text/plain", BTreeMap::new())
        .await
        .unwrap();

    let later = object.retain_until + Duration::days(365);
    let extended = storage.extend_retention(&object.storage_key, later).await.unwrap();
    assert_eq!(extended.retain_until, later);

    assert!(matches!(
        storage
            .extend_retention(&object.storage_key, object.retain_until)
            .await,
        Err(StorageError::RetentionActive { .. })
    ));
    assert_eq!(storage.head(&object.storage_key).await.unwrap().retain_until, later);
}

#[tokio::test]
async fn test_identical_store_is_idempotent() {
    let storage = ImmutableStorage::new(Arc::new(MemoryWormStore::new()), RETENTION_DAYS);
    let first = storage
        .store_evidence("ev-4", b"same bytes", "text/plain", BTreeMap::new())
        .await
        .unwrap();
    let second = storage
        .store_evidence("ev-4", b"same bytes", "text/plain", BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(first, second);

    // different content lands under a different key
    let other = storage
        .store_evidence("ev-4", b"other bytes", "text/plain", BTreeMap::new())
        .await
        .unwrap();
    assert_ne!(other.storage_key, first.storage_key);
}

#[tokio::test]
#[allow(clippy::permissions_set_readonly_false)]
async fn test_filesystem_tamper_is_detected() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(FilesystemWormStore::new(dir.path()).unwrap());
    let storage = ImmutableStorage::new(backend.clone(), RETENTION_DAYS);

    let (writer, _) = setup_writer_with_storage(4).await;
    record_many(&writer, 4).await;
    let bundle = writer.build_checkpoint_bundle(1).await.unwrap();
    let object = storage.store_checkpoint(1, &bundle).await.unwrap();
    assert_eq!(storage.retrieve_checkpoint(&object.storage_key).await.unwrap(), bundle);

    let path = backend.data_path(&object.storage_key).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    assert!(permissions.readonly());
    permissions.set_readonly(false);
    std::fs::set_permissions(&path, permissions).unwrap();
    let mut tampered = std::fs::read(&path).unwrap();
    tampered[0] = b' ';
    std::fs::write(&path, tampered).unwrap();

    let retrieved = storage.retrieve(&object.storage_key).await.unwrap();
    assert!(!retrieved.integrity_verified);
    assert!(matches!(
        storage.retrieve_checkpoint(&object.storage_key).await,
        Err(StorageError::IntegrityMismatch { .. })
    ));
}

#[tokio::test]
async fn test_stored_checkpoint_cannot_be_replaced_or_deleted() {
    let backend = Arc::new(MemoryWormStore::new());
    let storage = ImmutableStorage::new(backend.clone(), RETENTION_DAYS);

    let writer = setup_writer(3).await;
    record_many(&writer, 3).await;
    let bundle = writer.build_checkpoint_bundle(1).await.unwrap();
    let object = storage.store_checkpoint(1, &bundle).await.unwrap();

    let mut replacement = writer.build_checkpoint_bundle(1).await.unwrap();
    replacement.events.truncate(1);
    let forged = serde_json::to_vec_pretty(&replacement).unwrap();
    assert!(matches!(
        backend.put(put_request(&object.storage_key, &forged)).await,
        Err(StorageError::AlreadyExists(_))
    ));

    assert!(matches!(
        storage.delete(&object.storage_key).await,
        Err(StorageError::RetentionActive { .. })
    ));

    assert_eq!(storage.retrieve_checkpoint(&object.storage_key).await.unwrap(), bundle);
}
