//! In-memory store backend

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::{ArtifactStore, ObjectMeta};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// An in-memory [`ArtifactStore`].
///
/// Used by the test suites and handy for dry-running against a scratch
/// bucket. Access to individual keys can be revoked with [`MemoryStore::deny`]
/// to exercise restricted-bucket behavior: listings still show denied keys,
/// but reads against them fail with [`Error::Forbidden`], which is how
/// S3-style stores behave with per-object ACLs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    denied: RwLock<HashSet<String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Revoke read access to a key
    pub fn deny(&self, key: &str) {
        self.denied.write().unwrap().insert(key.to_string());
    }

    fn check_access(&self, key: &str) -> Result<()> {
        if self.denied.read().unwrap().contains(key) {
            return Err(Error::Forbidden(key.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.check_access(key)?;
        self.objects.write().unwrap().insert(
            key.to_string(),
            StoredObject {
                bytes,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_access(key)?;
        Ok(self
            .objects
            .read()
            .unwrap()
            .get(key)
            .map(|object| object.bytes.clone()))
    }

    async fn head_object(&self, key: &str) -> Result<bool> {
        self.check_access(key)?;
        Ok(self.objects.read().unwrap().contains_key(key))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.check_access(key)?;
        self.objects.write().unwrap().remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectMeta {
                key: key.clone(),
                size: object.bytes.len() as u64,
                last_modified: object.last_modified,
            })
            .collect())
    }

    async fn temporary_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.check_access(key)?;
        Ok(format!("memory://{}?expires_in={}", key, ttl.as_secs()))
    }
}
