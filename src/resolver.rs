//! Bucket-name routing over the configured refractions.
//!
//! Built once at startup from configuration: every remote gets one
//! [`BackedRemote`] shared by all refractions that list it, so probe caches
//! and metrics are per-remote rather than per-refraction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::cache::BackedRemote;
use crate::config::Config;
use crate::error::ResolveError;
use crate::index::PackageIndex;
use crate::ledger::ArtifactLedger;
use crate::metrics::Metrics;
use crate::partition::Partitioner;
use crate::refraction::Refraction;
use crate::request::RequestContext;
use crate::storage::{ArtifactStream, Storage};
use crate::upstream::build_upstream;

pub struct Resolver {
    refractions: HashMap<String, Arc<Refraction>>,
}

impl Resolver {
    /// Assemble the full remote/refraction graph from configuration.
    pub fn from_config(
        config: &Config,
        storage: Arc<dyn Storage>,
        partitioner: Arc<dyn Partitioner>,
        ledger: Arc<dyn ArtifactLedger>,
        index: Arc<dyn PackageIndex>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let mut remotes: HashMap<String, Arc<BackedRemote>> = HashMap::new();
        for remote in &config.remotes {
            let upstream = build_upstream(remote, &config.resolve, index.clone())
                .with_context(|| format!("building upstream client for remote {:?}", remote.name))?;
            let backed = BackedRemote::new(
                remote.clone(),
                upstream,
                partitioner.clone(),
                storage.clone(),
                ledger.clone(),
                metrics.clone(),
            )
            .with_context(|| format!("building cached remote {:?}", remote.name))?;
            remotes.insert(remote.name.clone(), Arc::new(backed));
        }

        let probe_timeout = Duration::from_secs(config.resolve.probe_timeout);
        let mut refractions = HashMap::new();
        for refraction in &config.refractions {
            let members = refraction
                .remotes
                .iter()
                .map(|name| {
                    remotes.get(name).cloned().with_context(|| {
                        format!(
                            "refraction {:?} references unknown remote {:?}",
                            refraction.name, name
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            refractions.insert(
                refraction.name.clone(),
                Arc::new(Refraction::new(
                    refraction.name.clone(),
                    members,
                    probe_timeout,
                    metrics.clone(),
                )),
            );
        }

        Ok(Self { refractions })
    }

    /// Configured bucket names, for introspection surfaces.
    pub fn bucket_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.refractions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Probe for `path` in the named bucket, returning the winning member.
    pub async fn probe(
        &self,
        bucket: &str,
        path: &str,
        ctx: &RequestContext,
    ) -> Result<Arc<BackedRemote>, ResolveError> {
        self.lookup(bucket)?.probe(path, ctx).await
    }

    /// Resolve and stream `path` from the named bucket.
    pub async fn resolve(
        &self,
        bucket: &str,
        path: &str,
        ctx: &mut RequestContext,
    ) -> Result<ArtifactStream, ResolveError> {
        self.lookup(bucket)?.download(path, ctx).await
    }

    fn lookup(&self, bucket: &str) -> Result<&Arc<Refraction>, ResolveError> {
        self.refractions.get(bucket).ok_or_else(|| {
            debug!(bucket = %bucket, "unknown bucket");
            ResolveError::NotFound
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::{Archetype, RefractionConfig};
    use crate::index::MemoryIndex;
    use crate::ledger::MemoryLedger;
    use crate::metrics::MetricsRegistry;
    use crate::partition::NoopPartitioner;
    use crate::storage::memory::MemoryStorage;

    fn test_config(upstream_uri: &str) -> Config {
        let yaml = format!(
            r#"
server:
  http_listen: "127.0.0.1:0"
storage:
  backend: memory
remotes:
  - id: 1
    name: mirror
    uri: "{upstream_uri}"
    archetype: generic
refractions:
  - name: all
    archetype: generic
    remotes: [mirror]
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn resolver(config: &Config, storage: Arc<dyn Storage>) -> Resolver {
        Resolver::from_config(
            config,
            storage,
            Arc::new(NoopPartitioner),
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryIndex::new()),
            MetricsRegistry::new().metrics,
        )
        .unwrap()
    }

    async fn collect(mut stream: ArtifactStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn unknown_bucket_is_not_found() {
        let config = test_config("http://127.0.0.1:9");
        let r = resolver(&config, Arc::new(MemoryStorage::new()));

        let mut ctx = RequestContext::anonymous();
        let err = r.resolve("no-such-bucket", "pkg.tgz", &mut ctx).await.err().unwrap();
        assert!(matches!(err, ResolveError::NotFound));
    }

    #[tokio::test]
    async fn resolve_routes_and_caches_through_the_named_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"artifact-bytes".to_vec()))
            .mount(&server)
            .await;

        let config = test_config(&server.uri());
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let r = resolver(&config, storage.clone());

        let mut ctx = RequestContext::anonymous();
        let body = collect(r.resolve("all", "pkg.tgz", &mut ctx).await.unwrap()).await;
        assert_eq!(body, b"artifact-bytes");

        // Wait for the asynchronous cache fill, then resolve again.
        for _ in 0..200 {
            if storage.head("mirror/pkg.tgz").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut ctx = RequestContext::anonymous();
        let again = collect(r.resolve("all", "pkg.tgz", &mut ctx).await.unwrap()).await;
        assert_eq!(again, b"artifact-bytes");

        // First resolution probed and downloaded; the second was served
        // entirely from storage.
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bucket_names_are_sorted() {
        let server_uri = "http://127.0.0.1:9";
        let mut config = test_config(server_uri);
        config.refractions.push(RefractionConfig {
            name: "alpha".to_string(),
            archetype: Archetype::Generic,
            remotes: vec!["mirror".to_string()],
        });
        let r = resolver(&config, Arc::new(MemoryStorage::new()));
        assert_eq!(r.bucket_names(), vec!["all", "alpha"]);
    }
}
