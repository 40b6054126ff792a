//! The object-store trait consumed by everything else

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Metadata for one stored object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Full object key, e.g. `myapp/20260block.slug`
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    /// Last modification time
    pub last_modified: DateTime<Utc>,
}

impl ObjectMeta {
    /// The key with its leading project segment removed
    pub fn name(&self) -> &str {
        self.key.split_once('/').map(|(_, rest)| rest).unwrap_or(&self.key)
    }

    /// The leading project segment of the key, if any
    pub fn project(&self) -> Option<&str> {
        self.key.split_once('/').map(|(project, _)| project)
    }
}

/// An object store holding slugs and tag-history files.
///
/// Keys are `/`-separated paths; the first segment is the project name.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an object, overwriting any existing one
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Fetch an object, `None` when it does not exist
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Check whether an object exists
    async fn head_object(&self, key: &str) -> Result<bool>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// List metadata for every object whose key starts with `prefix`
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// A URL from which the object can be fetched without credentials for
    /// the next `ttl`
    async fn temporary_url(&self, key: &str, ttl: Duration) -> Result<String>;
}
