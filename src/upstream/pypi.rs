use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::ResolveError;
use crate::index::PackageIndex;
use crate::request::RequestContext;
use crate::storage::ArtifactStream;
use crate::upstream::http::HttpUpstream;
use crate::upstream::Upstream;

/// PyPI paths arrive as `<project>/<filename>`; only the bare filename is
/// indexed.  Like Helm, existence comes from the externally maintained
/// package index and downloads follow the indexed URL.
pub struct PypiUpstream {
    inner: HttpUpstream,
    index: Arc<dyn PackageIndex>,
}

impl PypiUpstream {
    pub fn new(inner: HttpUpstream, index: Arc<dyn PackageIndex>) -> Self {
        Self { inner, index }
    }

    /// Strip the project prefix before the first `/`.
    fn distribution_filename(path: &str) -> &str {
        path.split_once('/').map_or(path, |(_, rest)| rest)
    }

    async fn lookup(&self, path: &str) -> Option<String> {
        let filename = Self::distribution_filename(path);
        match self.index.get_package(filename).await {
            Ok(found) => found,
            Err(e) => {
                warn!(upstream = %self.inner, error = %e, "package index lookup failed");
                None
            }
        }
    }
}

impl fmt::Display for PypiUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[async_trait::async_trait]
impl Upstream for PypiUpstream {
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
