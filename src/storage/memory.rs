use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::audit::entry::now_micros;
use crate::storage::backend::{validate_key, PutRequest, StoredObject, WormStore};
use crate::storage::StorageError;

/// Process-local WORM store, for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryWormStore {
    objects: RwLock<HashMap<String, (Vec<u8>, StoredObject)>>,
}

impl MemoryWormStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WormStore for MemoryWormStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, request: PutRequest) -> Result<StoredObject, StorageError> {
        validate_key(&request.key)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(&request.key) {
            return Err(StorageError::AlreadyExists(request.key));
        }

        let (content, object) = request.into_object(uuid::Uuid::new_v4().to_string(), now_micros());
        debug!("Stored {} ({} bytes) in memory", object.storage_key, object.size);
        objects.insert(object.storage_key.clone(), (content, object.clone()));
        Ok(object)
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, StoredObject), StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> Result<StoredObject, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|(_, object)| object.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn set_legal_hold(&self, key: &str, hold: bool) -> Result<StoredObject, StorageError> {
        let mut objects = self.objects.write().await;
        let (_, object) = objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        object.legal_hold = hold;
        Ok(object.clone())
    }

    async fn extend_retention(
        &self,
        key: &str,
        until: DateTime<Utc>,
    ) -> Result<StoredObject, StorageError> {
        let mut objects = self.objects.write().await;
        let (_, object) = objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        object.extend_retention(until)?;
        Ok(object.clone())
    }

    async fn delete(&self, key: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        let (_, object) = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        object.ensure_deletable(now)?;
        objects.remove(key);
        Ok(())
    }
}
