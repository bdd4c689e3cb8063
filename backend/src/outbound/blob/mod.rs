//! Filesystem-backed artifact store.
//!
//! Object storage itself is an external collaborator; this adapter carries
//! the same contract (put, ranged read, delete, prefix delete, optional
//! public URL) against a local directory, which is also what development and
//! CI run against.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::domain::ports::{ArtifactChunk, ArtifactStore, ArtifactStoreError};

/// Artifact store rooted at a local directory.
pub struct FsArtifactStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url
                .map(|base| base.trim_end_matches('/').to_string()),
        }
    }

    /// Resolve a blob key to a path under the root, rejecting traversal.
    fn path_for(&self, key: &str) -> Result<PathBuf, ArtifactStoreError> {
        if key.is_empty()
            || Path::new(key)
                .components()
                .any(|component| !matches!(component, std::path::Component::Normal(_)))
        {
            return Err(ArtifactStoreError::io(format!("invalid blob key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ArtifactStoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| ArtifactStoreError::io(error.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|error| ArtifactStoreError::io(error.to_string()))
    }

    async fn read(
        &self,
        key: &str,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<ArtifactChunk, ArtifactStoreError> {
        let path = self.path_for(key)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactStoreError::not_found(key));
            }
            Err(error) => return Err(ArtifactStoreError::io(error.to_string())),
        };
        let total_len = file
            .metadata()
            .await
            .map_err(|error| ArtifactStoreError::io(error.to_string()))?
            .len();

        let (start, end) = match range {
            None => (0, total_len.saturating_sub(1)),
            Some((start, end)) => (start, end.unwrap_or(total_len.saturating_sub(1))),
        };
        if start >= total_len || end < start {
            return Err(ArtifactStoreError::RangeNotSatisfiable {
                key: key.to_string(),
            });
        }
        let end = end.min(total_len.saturating_sub(1));

        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|error| ArtifactStoreError::io(error.to_string()))?;
        let mut bytes = vec![0_u8; (end - start + 1) as usize];
        file.read_exact(&mut bytes)
            .await
            .map_err(|error| ArtifactStoreError::io(error.to_string()))?;

        Ok(ArtifactChunk {
            bytes,
            offset: start,
            total_len,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(ArtifactStoreError::io(error.to_string())),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, ArtifactStoreError> {
        // Keys are slash-separated, so a prefix ending in `/` is a directory.
        let dir = self.path_for(prefix.trim_end_matches('/'))?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(1),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(error) => Err(ArtifactStoreError::io(error.to_string())),
        }
    }

    fn public_url(&self, key: &str) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{base}/{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn temp_store() -> (FsArtifactStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("slumbertale-blob-{}", uuid::Uuid::new_v4()));
        (FsArtifactStore::new(dir.clone(), None), dir)
    }

    #[rstest]
    #[tokio::test]
    async fn put_read_delete_round_trip() {
        let (store, dir) = temp_store();
        store.put("artifacts/v/s.mp3", b"0123456789").await.expect("put");

        let chunk = store
            .read("artifacts/v/s.mp3", Some((2, Some(5))))
            .await
            .expect("read");
        assert_eq!(chunk.bytes, b"2345");
        assert_eq!(chunk.total_len, 10);

        store.delete("artifacts/v/s.mp3").await.expect("delete");
        assert!(matches!(
            store.read("artifacts/v/s.mp3", None).await,
            Err(ArtifactStoreError::NotFound { .. })
        ));
        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[rstest]
    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (store, _dir) = temp_store();
        assert!(store.put("../escape.mp3", b"x").await.is_err());
        assert!(store.read("/etc/passwd", None).await.is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn public_url_requires_a_configured_base() {
        let (store, _dir) = temp_store();
        assert_eq!(store.public_url("a/b.mp3"), None);

        let with_base =
            FsArtifactStore::new("/tmp/unused", Some("https://cdn.example.test/".to_string()));
        assert_eq!(
            with_base.public_url("a/b.mp3"),
            Some("https://cdn.example.test/a/b.mp3".to_string())
        );
    }
}
