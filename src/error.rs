//! Error types for artifact resolution and storage.
//!
//! Resolution errors preserve the upstream HTTP status wherever one exists so
//! that the boundary layer can echo it back to the client instead of
//! collapsing everything into a generic failure.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Resolution errors
// ---------------------------------------------------------------------------

/// Errors produced while resolving an artifact through a remote.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The repository's allow/block patterns reject this path.
    #[error("path blocked by repository policy")]
    PolicyBlocked,

    /// The upstream answered with a non-success HTTP status.
    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    /// No queried upstream has the artifact.
    #[error("artifact not found")]
    NotFound,

    /// The caller abandoned the request before resolution finished.
    #[error("request canceled")]
    Canceled,

    /// The existence fan-out exceeded its deadline.
    #[error("existence check timed out after {0:?}")]
    Timeout(Duration),

    /// The upstream could not be reached at the transport level.
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    /// The storage backend failed while serving a cached artifact.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl ResolveError {
    /// The HTTP status carried by this error, when there is one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::UpstreamStatus(code) => Some(*code),
            _ => None,
        }
    }

    /// True for errors that mean "the artifact is simply not there":
    /// upstream 404s and transport-level unreachability.
    pub fn is_absence(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::UpstreamStatus(404) | Self::Unreachable(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the blob storage port.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The backend failed or rejected the operation.
    #[error("storage backend error: {0}")]
    Backend(String),
}
