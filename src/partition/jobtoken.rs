//! CI job-token partitioning.
//!
//! GitLab-style registries hand every CI job a fresh short-lived token.
//! Partitioning the cache by the raw token would give each job a cold cache,
//! so this strategy exchanges the token for the owning user's numeric id via
//! the instance's `/api/v4/job` introspection endpoint and partitions by
//! that id instead.  Resolved ids live in a bounded TTL cache keyed by the
//! raw token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use tracing::{debug, warn};

use crate::config::{PartitionConfig, RemoteConfig};
use crate::metrics::Metrics;
use crate::partition::Partitioner;

const API_MARKER: &str = "/api/v4";

pub struct JobTokenPartitioner {
    trigger_header: String,
    client: reqwest::Client,
    /// token -> resolved user id.  Expiry re-resolves silently on next use.
    cache: Cache<String, String>,
    metrics: Arc<Metrics>,
}

impl JobTokenPartitioner {
    pub fn new(config: &PartitionConfig, client: reqwest::Client, metrics: Arc<Metrics>) -> Self {
        Self {
            trigger_header: config.trigger_header.clone(),
            client,
            cache: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(Duration::from_secs(config.cache_ttl))
                .build(),
            metrics,
        }
    }

    /// Derive the introspection endpoint from a remote URI.
    ///
    /// `https://git.example.com/api/v4/projects/1/packages/npm` becomes
    /// `https://git.example.com/api/v4/job`.  URIs without the API marker
    /// cannot be introspected.
    fn introspection_endpoint(uri: &str) -> Option<String> {
        let idx = uri.find(API_MARKER)?;
        let base = &uri[..idx + API_MARKER.len()];
        Some(format!("{base}/job"))
    }

    /// One token-to-identity exchange round trip.
    async fn exchange(&self, remote: &RemoteConfig, header: &str, token: &str) -> Option<String> {
        let endpoint = Self::introspection_endpoint(&remote.uri)?;

        let resp = self
            .client
            .get(&endpoint)
            .header(header, token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                warn!(remote = %remote.name, error = %e, "job introspection request failed");
            })
            .ok()?;

        if !resp.status().is_success() {
            warn!(
                remote = %remote.name,
                status = %resp.status(),
                "job introspection returned non-success"
            );
            return None;
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| {
                warn!(remote = %remote.name, error = %e, "job introspection body unreadable");
            })
            .ok()?;

        let id = body
            .get("user")
            .and_then(|u| u.get("id"))
            .and_then(|v| v.as_i64())?;

        debug!(remote = %remote.name, user_id = id, "job token resolved");
        Some(id.to_string())
    }
}

#[async_trait]
impl Partitioner for JobTokenPartitioner {
    async fn apply(&self, remote: &RemoteConfig, header: &str, value: &str) -> (String, bool) {
        if !header.eq_ignore_ascii_case(&self.trigger_header) || value.is_empty() {
            return (value.to_string(), false);
        }

        if let Some(id) = self.cache.get(value).await {
            self.metrics.partition_rewrites.inc();
            return (id, true);
        }

        match self.exchange(remote, header, value).await {
            Some(id) => {
                self.cache.insert(value.to_string(), id.clone()).await;
                self.metrics.partition_rewrites.inc();
                (id, true)
            }
            // Best-effort: partition by the raw token instead.
            None => {
                self.metrics.partition_exchange_failures.inc();
                (value.to_string(), false)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
