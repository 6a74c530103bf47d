//! Per-request context carried through resolution.
//!
//! One context is built at the boundary for each inbound request and cloned
//! into every concurrent existence probe, so no two tasks ever mutate the
//! same instance.

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Auth mode
// ---------------------------------------------------------------------------

/// How caller credentials are forwarded to an upstream.
///
/// Doubles as the `security.auth_mode` config value describing what an
/// upstream requires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No credential is attached to upstream requests.
    #[default]
    None,
    /// `Authorization: Bearer <token>`.
    Bearer,
    /// The token is sent under a custom header name (e.g. `JOB-TOKEN`).
    Header,
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// Caller identity and cancellation state for one artifact request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Credential forwarding mode for this request.
    pub auth_mode: AuthMode,
    /// Header name the credential arrived under.
    pub header: String,
    /// The raw credential value.  Never logged.
    pub token: String,
    /// Stable identity substituted for the token by the partitioner.
    /// Empty until (and unless) partition resolution succeeds.
    pub partition: String,
    /// Fires when the caller goes away or the boundary times the request out.
    pub cancel: CancellationToken,
}

impl RequestContext {
    /// Anonymous context: no credential, fresh cancellation token.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Context for a credentialed request.
    pub fn with_credential(auth_mode: AuthMode, header: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            auth_mode,
            header: header.into(),
            token: token.into(),
            partition: String::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// The value partitioning the cache for this caller: the resolved
    /// partition when one exists, the raw token otherwise.
    pub fn partition_value(&self) -> &str {
        if self.partition.is_empty() {
            &self.token
        } else {
            &self.partition
        }
    }

    /// Whether a cache-partition segment applies to this request.
    ///
    /// Anonymous requests and remotes that take no credentials share one
    /// unpartitioned cache.
    pub fn is_partitioned(&self) -> bool {
        self.auth_mode != AuthMode::None && !self.token.is_empty()
    }
}
