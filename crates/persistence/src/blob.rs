//! Blob store contract and filesystem reference implementation

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::PersistenceError;

/// Object storage seam: put bytes under a key, get a public URL back.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, returning the object's public URL.
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        public_read: bool,
    ) -> Result<String, PersistenceError>;

    async fn exists(&self, key: &str) -> Result<bool, PersistenceError>;

    fn public_url(&self, key: &str) -> String;
}

/// Filesystem-backed blob store for single-node deployments.
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        // Keys are service-generated, but never follow one outside the root.
        if key.split('/').any(|part| part == "..") || Path::new(key).is_absolute() {
            return Err(PersistenceError::InvalidData(format!(
                "object key escapes storage root: {key}"
            )));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        _public_read: bool,
    ) -> Result<String, PersistenceError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(key, size = bytes.len(), content_type, "blob stored");
        Ok(self.public_url(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, PersistenceError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_traversal() {
        let store = FsBlobStore::new("/tmp/blobs", "http://localhost/blobs");
        assert!(store.resolve("audio/2026/01/a.mp3").is_ok());
        assert!(store.resolve("audio/../../etc/passwd").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
    }

    #[test]
    fn test_public_url_joins_cleanly() {
        let store = FsBlobStore::new("/tmp/blobs", "http://localhost/blobs/");
        assert_eq!(
            store.public_url("audio/2026/01/a.mp3"),
            "http://localhost/blobs/audio/2026/01/a.mp3"
        );
    }
}
