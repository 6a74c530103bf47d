//! Cache partitioning by caller identity.
//!
//! When an upstream requires per-caller tokens, cached bytes must be isolated
//! per identity so two callers never observe each other's artifacts.  Raw
//! tokens are poor partition values (they rotate per CI job), so a strategy
//! may exchange them for a stable identity.  Partitioning is best-effort:
//! every failure degrades to the raw token, never to a failed request.

pub mod jobtoken;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{PartitionConfig, PartitionStrategy, RemoteConfig};
use crate::metrics::Metrics;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Maps an inbound credential to the value that partitions the cache.
#[async_trait]
pub trait Partitioner: Send + Sync {
    /// Resolve `value` (which arrived under `header`) into a partition value
    /// for `remote`.  Returns the effective value and whether it was
    /// rewritten.  Never fails; a strategy that cannot resolve returns the
    /// input unchanged.
    async fn apply(&self, remote: &RemoteConfig, header: &str, value: &str) -> (String, bool);
}

// ---------------------------------------------------------------------------
// No-op strategy
// ---------------------------------------------------------------------------

/// Identity strategy: the raw token is the partition value.
pub struct NoopPartitioner;

#[async_trait]
impl Partitioner for NoopPartitioner {
    async fn apply(&self, _remote: &RemoteConfig, _header: &str, value: &str) -> (String, bool) {
        (value.to_string(), false)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the configured partitioning strategy.
pub fn build_partitioner(
    config: &PartitionConfig,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
) -> Arc<dyn Partitioner> {
    match config.strategy {
        PartitionStrategy::None => Arc::new(NoopPartitioner),
        PartitionStrategy::JobToken => {
            Arc::new(jobtoken::JobTokenPartitioner::new(config, client, metrics))
        }
    }
}
