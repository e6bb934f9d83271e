use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Metadata of one write-once object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub storage_key: String,
    pub version_id: String,
    /// SHA-256 of the content, hex.
    pub content_hash: String,
    pub content_type: String,
    pub size: u64,
    pub retain_until: DateTime<Utc>,
    pub legal_hold: bool,
    pub stored_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl StoredObject {
    pub fn is_retained_at(&self, now: DateTime<Utc>) -> bool {
        now < self.retain_until
    }

    /// Deletion is allowed only once retention has lapsed and no hold is set.
    pub fn ensure_deletable(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        if self.legal_hold {
            return Err(StorageError::LegalHold(self.storage_key.clone()));
        }
        if self.is_retained_at(now) {
            return Err(StorageError::RetentionActive {
                key: self.storage_key.clone(),
                retain_until: self.retain_until,
            });
        }
        Ok(())
    }

    /// Move the retention date forward. Earlier dates are rejected.
    pub fn extend_retention(&mut self, until: DateTime<Utc>) -> Result<(), StorageError> {
        if until < self.retain_until {
            return Err(StorageError::RetentionActive {
                key: self.storage_key.clone(),
                retain_until: self.retain_until,
            });
        }
        self.retain_until = until;
        Ok(())
    }
}

pub struct PutRequest {
    pub key: String,
    pub content: Vec<u8>,
    pub content_type: String,
    pub content_hash: String,
    pub retain_until: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl PutRequest {
    pub fn into_object(self, version_id: String, stored_at: DateTime<Utc>) -> (Vec<u8>, StoredObject) {
        let object = StoredObject {
            storage_key: self.key,
            version_id,
            content_hash: self.content_hash,
            content_type: self.content_type,
            size: self.content.len() as u64,
            retain_until: self.retain_until,
            legal_hold: false,
            stored_at,
            metadata: self.metadata,
        };
        (self.content, object)
    }
}

/// A write-once object store.
///
/// `put` never replaces an existing key and fails with `AlreadyExists`.
/// Content is never mutated; only the hold flag and the retention date
/// (forward only) can change.
#[async_trait]
pub trait WormStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn put(&self, request: PutRequest) -> Result<StoredObject, StorageError>;

    async fn get(&self, key: &str) -> Result<(Vec<u8>, StoredObject), StorageError>;

    async fn head(&self, key: &str) -> Result<StoredObject, StorageError>;

    async fn set_legal_hold(&self, key: &str, hold: bool) -> Result<StoredObject, StorageError>;

    async fn extend_retention(
        &self,
        key: &str,
        until: DateTime<Utc>,
    ) -> Result<StoredObject, StorageError>;

    async fn delete(&self, key: &str, now: DateTime<Utc>) -> Result<(), StorageError>;
}

/// Keys are relative `/`-separated paths of `[A-Za-z0-9._-]` segments.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    for segment in key.split('/') {
        let valid = !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("checkpoints/default/0000000001-abcd.json").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/b c").is_err());
    }

    #[test]
    fn test_retention_never_shortens() {
        let now = Utc::now();
        let mut object = StoredObject {
            storage_key: "k".to_string(),
            version_id: "v".to_string(),
            content_hash: "h".to_string(),
            content_type: "text/plain".to_string(),
            size: 0,
            retain_until: now + chrono::Duration::days(10),
            legal_hold: false,
            stored_at: now,
            metadata: BTreeMap::new(),
        };

        assert!(object.extend_retention(now + chrono::Duration::days(5)).is_err());
        object.extend_retention(now + chrono::Duration::days(20)).unwrap();
        assert!(matches!(
            object.ensure_deletable(now),
            Err(StorageError::RetentionActive { .. })
        ));

        object.legal_hold = true;
        assert!(matches!(
            object.ensure_deletable(now + chrono::Duration::days(30)),
            Err(StorageError::LegalHold(_))
        ));

        object.legal_hold = false;
        assert!(object.ensure_deletable(now + chrono::Duration::days(30)).is_ok());
    }
}
