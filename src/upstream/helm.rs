use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::ResolveError;
use crate::index::PackageIndex;
use crate::request::RequestContext;
use crate::storage::ArtifactStream;
use crate::upstream::http::HttpUpstream;
use crate::upstream::Upstream;

/// Helm repositories answer existence from the chart index rather than live
/// probes: `index.yaml` is the source of truth and is maintained by an
/// external indexer.  Downloads follow the indexed URL, which may point at a
/// different host than the repository root.
pub struct HelmUpstream {
    inner: HttpUpstream,
    index: Arc<dyn PackageIndex>,
}

impl HelmUpstream {
    pub fn new(inner: HttpUpstream, index: Arc<dyn PackageIndex>) -> Self {
        Self { inner, index }
    }

    fn chart_filename(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }

    async fn lookup(&self, path: &str) -> Option<String> {
        let filename = Self::chart_filename(path);
        match self.index.get_package(filename).await {
            Ok(found) => found,
            Err(e) => {
                warn!(upstream = %self.inner, error = %e, "chart index lookup failed");
                None
            }
        }
    }
}

impl fmt::Display for HelmUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[async_trait::async_trait]
impl Upstream for HelmUpstream {
    async fn exists(&self, path: &str, _ctx: &RequestContext) -> Result<String, ResolveError> {
        self.lookup(path).await.ok_or(ResolveError::NotFound)
    }

    async fn download(&self, path: &str, ctx: &RequestContext)
        -> Result<ArtifactStream, ResolveError> {
        match self.lookup(path).await {
            Some(url) => self.inner.download(&url, ctx).await,
            None => self.inner.download(path, ctx).await,
        }
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
    use crate::config::{Archetype, RemoteConfig, ResolveConfig};
    use crate::index::MemoryIndex;

    fn remote(uri: impl Into<String>) -> RemoteConfig {
        RemoteConfig {
            id: 3,
            name: "charts".to_string(),
            uri: uri.into(),
            archetype: Archetype::Helm,
            security: Default::default(),
            transport: Default::default(),
        }
    }

    fn helm_upstream(uri: impl Into<String>, index: Arc<MemoryIndex>) -> HelmUpstream {
        let inner = HttpUpstream::new(&remote(uri), &ResolveConfig::default()).unwrap();
        HelmUpstream::new(inner, index)
    }

    #[tokio::test]
    async fn exists_answers_from_index_without_probing() {
        let index = Arc::new(MemoryIndex::new());
        index
            .insert("nginx-1.2.3.tgz", "https://cdn.example.com/nginx-1.2.3.tgz")
            .await;

        // Root points nowhere; a live probe would fail with Unreachable.
        let u = helm_upstream("http://127.0.0.1:9", index);
        let ctx = RequestContext::anonymous();

        let uri = u.exists("charts/nginx-1.2.3.tgz", &ctx).await.unwrap();
        assert_eq!(uri, "https://cdn.example.com/nginx-1.2.3.tgz");
    }

    #[tokio::test]
    async fn unindexed_chart_is_not_found() {
        let u = helm_upstream("http://127.0.0.1:9", Arc::new(MemoryIndex::new()));
        let ctx = RequestContext::anonymous();
        let err = u.exists("charts/absent-1.0.0.tgz", &ctx).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound));
    }

    #[tokio::test]
    async fn download_follows_the_indexed_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hosted/nginx-1.2.3.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"chart".to_vec()))
            .mount(&server)
            .await;

        let index = Arc::new(MemoryIndex::new());
        index
            .insert("nginx-1.2.3.tgz", format!("{}/hosted/nginx-1.2.3.tgz", server.uri()))
            .await;

        let u = helm_upstream("http://127.0.0.1:9", index);
        let ctx = RequestContext::anonymous();

        let mut stream = u.download("nginx-1.2.3.tgz", &ctx).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk, bytes::Bytes::from_static(b"chart"));
    }
}
