//! Read-through caching wrapper around one upstream remote.
//!
//! A [`BackedRemote`] answers existence probes from the blob store when it
//! can, and on a miss fetches from the upstream while opportunistically
//! filling the cache.  The caller's stream is never coupled to the fill:
//! bytes are relayed as they arrive and the store write happens after the
//! response, only for streams that reached a clean EOF.

use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

use crate::cache::key;
use crate::config::RemoteConfig;
use crate::error::ResolveError;
use crate::ledger::ArtifactLedger;
use crate::metrics::{Metrics, RemoteLabels};
use crate::partition::Partitioner;
use crate::policy::Enforcer;
use crate::request::{AuthMode, RequestContext};
use crate::storage::{ArtifactStream, Storage};
use crate::upstream::Upstream;

// ---------------------------------------------------------------------------
// BackedRemote
// ---------------------------------------------------------------------------

pub struct BackedRemote {
    remote: RemoteConfig,
    enforcer: Enforcer,
    upstream: Arc<dyn Upstream>,
    partitioner: Arc<dyn Partitioner>,
    storage: Arc<dyn Storage>,
    ledger: Arc<dyn ArtifactLedger>,
    metrics: Arc<Metrics>,
}

impl BackedRemote {
    /// Wire one remote to its upstream client and the shared cache plumbing.
    /// Fails only on invalid security patterns.
    pub fn new(
        remote: RemoteConfig,
        upstream: Arc<dyn Upstream>,
        partitioner: Arc<dyn Partitioner>,
        storage: Arc<dyn Storage>,
        ledger: Arc<dyn ArtifactLedger>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let enforcer = Enforcer::new(remote.archetype, &remote.security)?;
        Ok(Self {
            remote,
            enforcer,
            upstream,
            partitioner,
            storage,
            ledger,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.remote.name
    }

    /// Probe for `path`, preferring the cache over the upstream.
    ///
    /// Returns the path itself on a cache hit, the upstream's resolved URI
    /// otherwise.
    #[instrument(skip(self, ctx), fields(remote = %self.remote.name))]
    pub async fn exists(
        &self,
        path: &str,
        ctx: &mut RequestContext,
    ) -> Result<String, ResolveError> {
        if !self.enforcer.can_receive(path) {
            debug!(path = %path, "path blocked by policy");
            return Err(ResolveError::PolicyBlocked);
        }

        self.apply_partition(ctx).await;

        if self.enforcer.can_cache(path) {
            let key = key::derive(&self.remote, path, ctx);
            if self.cached(&key.storage_key).await {
                self.metrics.cache_hits.get_or_create(&self.labels()).inc();
                self.record_access(&key.normalized_path).await;
                return Ok(path.to_string());
            }
            self.metrics.cache_misses.get_or_create(&self.labels()).inc();

            // Known-but-not-yet-stored: the probe marks the artifact in the
            // ledger, the bytes arrive with the first download.
            let resolved = self.upstream.exists(path, ctx).await?;
            self.record_access(&key.normalized_path).await;
            return Ok(resolved);
        }

        self.upstream.exists(path, ctx).await
    }

    /// Fetch `path`, from the cache when possible, filling it when not.
    #[instrument(skip(self, ctx), fields(remote = %self.remote.name))]
    pub async fn download(
        &self,
        path: &str,
        ctx: &mut RequestContext,
    ) -> Result<ArtifactStream, ResolveError> {
        self.apply_partition(ctx).await;

        // A remote that takes no credentials shares one unpartitioned cache
        // and must never see the caller's token.
        if self.remote.security.auth_mode == AuthMode::None {
            ctx.auth_mode = AuthMode::None;
        }

        if !self.enforcer.can_cache(path) {
            return self.upstream.download(path, ctx).await;
        }

        let key = key::derive(&self.remote, path, ctx);
        if self.cached(&key.storage_key).await {
            self.metrics.cache_hits.get_or_create(&self.labels()).inc();
            self.record_access(&key.normalized_path).await;
            return Ok(self.storage.get(&key.storage_key).await?);
        }
        self.metrics.cache_misses.get_or_create(&self.labels()).inc();

        let upstream_stream = self.upstream.download(path, ctx).await?;
        self.record_access(&key.normalized_path).await;
        debug!(key = %key.storage_key, "filling cache from upstream");
        Ok(self.tee_to_storage(key.storage_key, upstream_stream))
    }

    // -- internals ----------------------------------------------------------

    async fn apply_partition(&self, ctx: &mut RequestContext) {
        let (value, rewritten) = self
            .partitioner
            .apply(&self.remote, &ctx.header, &ctx.token)
            .await;
        if rewritten {
            ctx.partition = value;
        }
    }

    /// Head with storage faults degraded to a miss.
    async fn cached(&self, storage_key: &str) -> bool {
        match self.storage.head(storage_key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "storage head failed; treating as miss");
                false
            }
        }
    }

    async fn record_access(&self, path: &str) {
        if let Err(e) = self.ledger.record_access(path, self.remote.id).await {
            warn!(remote = %self.remote.name, path = %path, error = %e, "access recording failed");
        }
    }

    fn labels(&self) -> RemoteLabels {
        RemoteLabels {
            remote: self.remote.name.clone(),
        }
    }

    /// Relay upstream chunks to the caller while accumulating a copy, and
    /// commit the copy only after a clean upstream EOF.  The fill is
    /// opportunistic: a failed write is logged and counted, never surfaced.
    fn tee_to_storage(&self, storage_key: String, mut upstream: ArtifactStream) -> ArtifactStream {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(32);
        let storage = Arc::clone(&self.storage);
        let metrics = Arc::clone(&self.metrics);
        let remote = self.remote.name.clone();

        tokio::spawn(async move {
            let mut body = BytesMut::new();
            let mut complete = true;

            while let Some(chunk_result) = upstream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        body.extend_from_slice(&chunk);
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Client disconnected; never commit a partial body.
                            complete = false;
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        complete = false;
                        break;
                    }
                }
            }

            if complete {
                match storage.put(&storage_key, body.freeze()).await {
                    Ok(()) => debug!(remote = %remote, key = %storage_key, "artifact cached"),
                    Err(e) => {
                        metrics.storage_write_failures.inc();
                        warn!(
                            remote = %remote,
                            key = %storage_key,
                            error = %e,
                            "cache fill failed; response already served"
                        );
                    }
                }
            }
        });

        ReceiverStream::new(rx).boxed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;

    use super::*;
    use crate::config::Archetype;
    use crate::error::StorageError;
    use crate::ledger::MemoryLedger;
    use crate::metrics::MetricsRegistry;
    use crate::partition::NoopPartitioner;
    use crate::storage::memory::MemoryStorage;

    // ── Stubs ───────────────────────────────────────────────────────────

    struct StubUpstream {
        body: Bytes,
        exists_calls: AtomicUsize,
        download_calls: AtomicUsize,
        seen_auth_modes: Mutex<Vec<AuthMode>>,
    }

    impl StubUpstream {
        fn new(body: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                body: Bytes::copy_from_slice(body),
                exists_calls: AtomicUsize::new(0),
                download_calls: AtomicUsize::new(0),
                seen_auth_modes: Mutex::new(Vec::new()),
            })
        }
    }

    impl fmt::Display for StubUpstream {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "stub")
        }
    }

    #[async_trait]
    impl Upstream for StubUpstream {
        async fn exists(&self, path: &str, ctx: &RequestContext) -> Result<String, ResolveError> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_auth_modes.lock().unwrap().push(ctx.auth_mode);
            Ok(format!("https://stub.example/{path}"))
        }

        async fn download(
            &self,
            _path: &str,
            ctx: &RequestContext,
        ) -> Result<ArtifactStream, ResolveError> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_auth_modes.lock().unwrap().push(ctx.auth_mode);
            let chunks = vec![Ok(self.body.clone())];
            Ok(stream::iter(chunks).boxed())
        }
    }

    /// Storage whose writes always fail; reads behave like an empty store.
    struct BrokenStorage;

    #[async_trait]
    impl Storage for BrokenStorage {
        async fn get(&self, key: &str) -> Result<ArtifactStream, StorageError> {
            Err(StorageError::NotFound(key.to_string()))
        }

        async fn put(&self, _key: &str, _body: Bytes) -> Result<(), StorageError> {
            Err(StorageError::Backend("disk full".to_string()))
        }

        async fn head(&self, _key: &str) -> Result<bool, StorageError> {
            Ok(false)
        }

        async fn size(&self, _prefix: &str) -> Result<(u64, u64), StorageError> {
            Ok((0, 0))
        }
    }

    // ── Harness ─────────────────────────────────────────────────────────

    fn npm_remote() -> RemoteConfig {
        RemoteConfig {
            id: 3,
            name: "npmjs".to_string(),
            uri: "https://registry.npmjs.org".to_string(),
            archetype: Archetype::Npm,
            security: Default::default(),
            transport: Default::default(),
        }
    }

    fn backed(
        remote: RemoteConfig,
        stub: Arc<StubUpstream>,
        storage: Arc<dyn Storage>,
    ) -> (BackedRemote, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let remote_cfg = BackedRemote::new(
            remote,
            stub,
            Arc::new(NoopPartitioner),
            storage,
            ledger.clone(),
            MetricsRegistry::new().metrics,
        )
        .unwrap();
        (remote_cfg, ledger)
    }

    async fn collect(mut stream: ArtifactStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    /// The cache fill runs after the response stream ends, so tests poll.
    async fn wait_for_object(storage: &dyn Storage, key: &str) {
        for _ in 0..200 {
            if storage.head(key).await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("object {key} never appeared in storage");
    }

    const TARBALL: &str = "lodash/-/lodash-4.17.21.tgz";

    // ── Read-through behaviour ──────────────────────────────────────────

    #[tokio::test]
    async fn second_download_is_served_from_storage() {
        let stub = StubUpstream::new(b"tarball-bytes");
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (remote, _) = backed(npm_remote(), stub.clone(), storage.clone());

        let mut ctx = RequestContext::anonymous();
        let first = collect(remote.download(TARBALL, &mut ctx).await.unwrap()).await;
        assert_eq!(first, b"tarball-bytes");

        wait_for_object(storage.as_ref(), &format!("npmjs/{TARBALL}")).await;

        let mut ctx = RequestContext::anonymous();
        let second = collect(remote.download(TARBALL, &mut ctx).await.unwrap()).await;
        assert_eq!(second, b"tarball-bytes");
        assert_eq!(stub.download_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exists_prefers_the_cache() {
        let stub = StubUpstream::new(b"x");
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage
            .put(&format!("npmjs/{TARBALL}"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        let (remote, ledger) = backed(npm_remote(), stub.clone(), storage);

        let mut ctx = RequestContext::anonymous();
        let resolved = remote.exists(TARBALL, &mut ctx).await.unwrap();

        assert_eq!(resolved, TARBALL);
        assert_eq!(stub.exists_calls.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.accesses(TARBALL, 3).await, 1);
    }

    #[tokio::test]
    async fn exists_falls_through_to_upstream_on_miss() {
        let stub = StubUpstream::new(b"x");
        let (remote, ledger) = backed(npm_remote(), stub.clone(), Arc::new(MemoryStorage::new()));

        let mut ctx = RequestContext::anonymous();
        let resolved = remote.exists(TARBALL, &mut ctx).await.unwrap();

        assert_eq!(resolved, format!("https://stub.example/{TARBALL}"));
        assert_eq!(stub.exists_calls.load(Ordering::SeqCst), 1);
        // A successful probe marks the artifact as known even before any
        // bytes are stored.
        assert_eq!(ledger.accesses(TARBALL, 3).await, 1);
    }

    #[tokio::test]
    async fn non_cacheable_paths_bypass_storage() {
        let stub = StubUpstream::new(b"{\"name\":\"lodash\"}");
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (remote, _) = backed(npm_remote(), stub.clone(), storage.clone());

        // Package metadata is mutable and must always come from upstream.
        for _ in 0..2 {
            let mut ctx = RequestContext::anonymous();
            collect(remote.download("lodash", &mut ctx).await.unwrap()).await;
        }

        assert_eq!(stub.download_calls.load(Ordering::SeqCst), 2);
        assert_eq!(storage.size("").await.unwrap(), (0, 0));
    }

    // ── Policy ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn blocked_path_never_reaches_upstream() {
        let stub = StubUpstream::new(b"x");
        let mut remote_cfg = npm_remote();
        remote_cfg.security.blocked_patterns = vec!["^/?(super-secret).+".to_string()];
        let (remote, _) = backed(remote_cfg, stub.clone(), Arc::new(MemoryStorage::new()));

        let mut ctx = RequestContext::anonymous();
        let err = remote.exists("super-secret/file.txt", &mut ctx).await.unwrap_err();

        assert!(matches!(err, ResolveError::PolicyBlocked));
        assert_eq!(stub.exists_calls.load(Ordering::SeqCst), 0);
    }

    // ── Partitioning ────────────────────────────────────────────────────

    #[tokio::test]
    async fn distinct_partitions_fill_distinct_objects() {
        let stub = StubUpstream::new(b"tarball-bytes");
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut remote_cfg = npm_remote();
        remote_cfg.security.auth_mode = AuthMode::Bearer;
        let (remote, _) = backed(remote_cfg.clone(), stub.clone(), storage.clone());

        for token in ["tok-alice", "tok-bob"] {
            let mut ctx = RequestContext::with_credential(AuthMode::Bearer, "Authorization", token);
            collect(remote.download(TARBALL, &mut ctx).await.unwrap()).await;
            let expected = key::derive(&remote_cfg, TARBALL, &ctx);
            wait_for_object(storage.as_ref(), &expected.storage_key).await;
        }

        // Neither caller saw the other's cache entry.
        assert_eq!(stub.download_calls.load(Ordering::SeqCst), 2);
        let (count, _) = storage.size("npmjs/").await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn credentials_are_stripped_for_anonymous_remotes() {
        let stub = StubUpstream::new(b"tarball-bytes");
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (remote, _) = backed(npm_remote(), stub.clone(), storage.clone());

        let mut ctx = RequestContext::with_credential(AuthMode::Bearer, "Authorization", "tok");
        collect(remote.download(TARBALL, &mut ctx).await.unwrap()).await;

        assert_eq!(stub.seen_auth_modes.lock().unwrap().as_slice(), [AuthMode::None]);
        // The fill landed on the shared, unpartitioned key.
        wait_for_object(storage.as_ref(), &format!("npmjs/{TARBALL}")).await;
    }

    #[tokio::test]
    async fn partition_exchange_failure_does_not_fail_downloads() {
        use crate::config::{PartitionConfig, PartitionStrategy};
        use crate::partition::build_partitioner;

        let stub = StubUpstream::new(b"tarball-bytes");
        let mut remote_cfg = npm_remote();
        // Introspection endpoint that nothing listens on.
        remote_cfg.uri = "http://127.0.0.1:9/api/v4/projects/1/packages/npm".to_string();
        remote_cfg.security.auth_mode = AuthMode::Header;

        let partitioner = build_partitioner(
            &PartitionConfig {
                strategy: PartitionStrategy::JobToken,
                ..Default::default()
            },
            reqwest::Client::new(),
            MetricsRegistry::new().metrics,
        );
        let remote = BackedRemote::new(
            remote_cfg,
            stub.clone(),
            partitioner,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryLedger::new()),
            MetricsRegistry::new().metrics,
        )
        .unwrap();

        let mut ctx = RequestContext::with_credential(AuthMode::Header, "JOB-TOKEN", "tok-job");
        let body = collect(remote.download(TARBALL, &mut ctx).await.unwrap()).await;

        assert_eq!(body, b"tarball-bytes");
        // The exchange failed, so the raw token still partitions the cache.
        assert!(ctx.partition.is_empty());
    }

    // ── Fill failure tolerance ──────────────────────────────────────────

    #[tokio::test]
    async fn write_failure_is_invisible_to_the_caller() {
        let stub = StubUpstream::new(b"tarball-bytes");
        let ledger = Arc::new(MemoryLedger::new());
        let metrics = MetricsRegistry::new().metrics;
        let remote = BackedRemote::new(
            npm_remote(),
            stub.clone(),
            Arc::new(NoopPartitioner),
            Arc::new(BrokenStorage),
            ledger,
            metrics.clone(),
        )
        .unwrap();

        let mut ctx = RequestContext::anonymous();
        let body = collect(remote.download(TARBALL, &mut ctx).await.unwrap()).await;
        assert_eq!(body, b"tarball-bytes");

        for _ in 0..200 {
            if metrics.storage_write_failures.get() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("write failure was never counted");
    }
}
