//! Blob storage port.
//!
//! Artifacts are opaque byte blobs addressed by slash-separated keys.  The
//! port deliberately has no transactional surface: `put` over an existing key
//! is last-writer-wins, and a concurrent reader sees either the old or the
//! fully written new object, never a partial one.

pub mod memory;
pub mod s3;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::config::{StorageBackendType, StorageConfig};
use crate::error::StorageError;

/// Byte stream of one stored or in-flight artifact.
pub type ArtifactStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the artifact blob store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stream the object at `key`.  [`StorageError::NotFound`] when absent.
    async fn get(&self, key: &str) -> Result<ArtifactStream, StorageError>;

    /// Write `body` under `key`, replacing any existing object.
    async fn put(&self, key: &str, body: Bytes) -> Result<(), StorageError>;

    /// Whether an object exists at `key`.
    async fn head(&self, key: &str) -> Result<bool, StorageError>;

    /// Recursive `(object_count, total_bytes)` under `prefix`.
    async fn size(&self, prefix: &str) -> Result<(u64, u64), StorageError>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the configured storage backend.
pub async fn build_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match config.backend {
        StorageBackendType::S3 => {
            let s3_config = config
                .s3
                .as_ref()
                .context("storage.backend is s3 but storage.s3 is missing")?;
            Ok(Arc::new(s3::S3Storage::from_config(s3_config).await))
        }
        StorageBackendType::Memory => Ok(Arc::new(memory::MemoryStorage::new())),
    }
}
