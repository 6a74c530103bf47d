//! Upstream registry clients.
//!
//! One [`Upstream`] per configured remote, selected by archetype: plain HTTP
//! for most ecosystems, index-backed variants for Helm and PyPI where
//! existence is answered from externally maintained package metadata instead
//! of a live probe.

pub mod helm;
pub mod http;
pub mod pypi;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{Archetype, RemoteConfig, ResolveConfig};
use crate::error::ResolveError;
use crate::index::PackageIndex;
use crate::request::RequestContext;
use crate::storage::ArtifactStream;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Probe and fetch against one upstream registry.
#[async_trait]
pub trait Upstream: Send + Sync + fmt::Display {
    /// Whether `path` exists upstream.  Returns the resolved URI on success;
    /// failures carry the upstream status so callers can rank them.
    async fn exists(&self, path: &str, ctx: &RequestContext) -> Result<String, ResolveError>;

    /// Fetch the artifact bytes.  Never cached at this layer.
    async fn download(&self, path: &str, ctx: &RequestContext)
        -> Result<ArtifactStream, ResolveError>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the archetype-appropriate client for one remote.
pub fn build_upstream(
    remote: &RemoteConfig,
    resolve: &ResolveConfig,
    index: Arc<dyn PackageIndex>,
) -> Result<Arc<dyn Upstream>> {
    let base = http::HttpUpstream::new(remote, resolve)?;
    Ok(match remote.archetype {
        Archetype::Helm => Arc::new(helm::HelmUpstream::new(base, index)),
        Archetype::Pip => Arc::new(pypi::PypiUpstream::new(base, index)),
        _ => Arc::new(base),
    })
}
