//! Directory-tree store backend

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::store::{ArtifactStore, ObjectMeta};
use crate::{Error, Result};

/// An [`ArtifactStore`] backed by a local directory tree.
///
/// Object keys map directly onto relative paths below the root, so the
/// layout stays browsable with ordinary shell tools. Useful for single-node
/// setups and for NFS-mounted shared buckets.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|segment| segment == ".." || segment.is_empty())
        {
            return Err(Error::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn collect_objects(&self, dir: &Path, prefix: &str, out: &mut Vec<ObjectMeta>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.collect_objects(&path, prefix, out)?;
            } else if file_type.is_file() {
                let key = path
                    .strip_prefix(&self.root)
                    .map_err(|_| Error::Other(format!("path escaped root: {}", path.display())))?
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(prefix) {
                    continue;
                }
                let metadata = entry.metadata()?;
                let last_modified: DateTime<Utc> = metadata
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now());
                out.push(ObjectMeta {
                    key,
                    size: metadata.len(),
                    last_modified,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for DirStore {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        debug!(key, size = bytes.len(), "writing object");
        fs::write(path, bytes)?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(Error::Forbidden(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn head_object(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key)?.is_file())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        self.collect_objects(&self.root, prefix, &mut out)?;
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn temporary_url(&self, key: &str, _ttl: Duration) -> Result<String> {
        let path = self.object_path(key)?;
        if !path.is_file() {
            return Err(Error::Other(format!("no such object: {key}")));
        }
        Ok(format!("file://{}", path.display()))
    }
}
