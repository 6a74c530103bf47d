use std::collections::HashMap;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::storage::{ArtifactStream, Storage};

/// In-process artifact store backed by a map.  Development and tests only;
/// contents vanish with the process.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<ArtifactStream, StorageError> {
        let objects = self.objects.read().await;
        let body = objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(futures_util::stream::once(async move { Ok(body) }).boxed())
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
        self.objects.write().await.insert(key.to_string(), body);
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn size(&self, prefix: &str) -> Result<(u64, u64), StorageError> {
        let objects = self.objects.read().await;
        let mut count = 0;
        let mut bytes = 0;
        for (key, body) in objects.iter() {
            if key.starts_with(prefix) {
                count += 1;
                bytes += body.len() as u64;
            }
        }
        Ok((count, bytes))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
