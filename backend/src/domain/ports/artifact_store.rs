//! Port for artifact and sample blob storage.
//!
//! Object-store internals stay behind this contract: put, ranged read,
//! delete, prefix delete, and an optional public URL for redirect-style
//! serving.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

/// Errors raised by artifact store adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactStoreError {
    /// No blob exists under this key.
    #[error("artifact not found: {key}")]
    NotFound { key: String },
    /// The requested byte range is unsatisfiable.
    #[error("artifact range not satisfiable for {key}")]
    RangeNotSatisfiable { key: String },
    /// Backend I/O failed.
    #[error("artifact store io failed: {message}")]
    Io { message: String },
}

impl ArtifactStoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }
}

/// A full or partial blob read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactChunk {
    pub bytes: Vec<u8>,
    /// Offset of `bytes` within the blob.
    pub offset: u64,
    /// Total blob length, for `Content-Range` headers.
    pub total_len: u64,
}

/// Port for blob storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ArtifactStoreError>;

    /// Read the blob, optionally restricted to `[start, end]` (inclusive,
    /// `end` unbounded when `None`).
    async fn read(
        &self,
        key: &str,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<ArtifactChunk, ArtifactStoreError>;

    /// Delete a blob. Idempotent.
    async fn delete(&self, key: &str) -> Result<(), ArtifactStoreError>;

    /// Delete every blob under a prefix; returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, ArtifactStoreError>;

    /// A client-reachable URL for the blob, when the backend can mint one.
    fn public_url(&self, key: &str) -> Option<String>;
}

/// In-memory blob fixture.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ArtifactStoreError> {
        self.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read(
        &self,
        key: &str,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<ArtifactChunk, ArtifactStoreError> {
        let blobs = self.lock();
        let blob = blobs
            .get(key)
            .ok_or_else(|| ArtifactStoreError::not_found(key))?;
        let total_len = blob.len() as u64;
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
        Ok(ArtifactChunk {
            bytes: blob[start as usize..=end as usize].to_vec(),
            offset: start,
            total_len,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactStoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, ArtifactStoreError> {
        let mut blobs = self.lock();
        let before = blobs.len();
        blobs.retain(|key, _| !key.starts_with(prefix));
        Ok((before - blobs.len()) as u64)
    }

    fn public_url(&self, _key: &str) -> Option<String> {
        None
    }
}
