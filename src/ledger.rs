//! Artifact access accounting.
//!
//! The core fires one access event per successful cacheable resolution; the
//! entity storage behind it (download counters, timestamps) belongs to an
//! external repository.  Recording is fire-and-forget: callers log failures
//! and continue.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Increment-or-create access accounting for one artifact path per remote.
#[async_trait]
pub trait ArtifactLedger: Send + Sync {
    async fn record_access(&self, path: &str, remote_id: i64) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Counter map used by tests and single-node development runs.
#[derive(Default)]
pub struct MemoryLedger {
    counts: RwLock<HashMap<(String, i64), u64>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded access count for `(path, remote_id)`.
    pub async fn accesses(&self, path: &str, remote_id: i64) -> u64 {
        self.counts
            .read()
            .await
            .get(&(path.to_string(), remote_id))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ArtifactLedger for MemoryLedger {
    async fn record_access(&self, path: &str, remote_id: i64) -> Result<()> {
        let mut counts = self.counts.write().await;
        *counts.entry((path.to_string(), remote_id)).or_insert(0) += 1;
        Ok(())
    }
}
