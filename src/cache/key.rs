//! Storage-key derivation.
//!
//! Keys are never persisted as data, only used to address blobs, so this
//! layout is a stable contract:
//! `<remote-name>/<normalized-path>[/<sha256-hex of partition value>]`.
//! The partition segment exists only for credentialed requests against
//! remotes that require authentication; everything else shares one
//! unpartitioned key space.

use sha2::{Digest, Sha256};

use crate::config::RemoteConfig;
use crate::request::RequestContext;

/// A derived storage address for one (remote, path, partition) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Full blob-store key.
    pub storage_key: String,
    /// Upstream path with the remote's URI prefix and any scheme/host
    /// stripped; also the path recorded with access events.
    pub normalized_path: String,
}

/// Derive the cache key for `path` under `remote` as seen by `ctx`.
///
/// Identical (remote, path, partition) triples always derive the same key;
/// distinct partitions never collide because the partition segment is a
/// digest of the partition value itself.
pub fn derive(remote: &RemoteConfig, path: &str, ctx: &RequestContext) -> CacheKey {
    let normalized_path = normalize_path(&remote.uri, path);

    let storage_key = if ctx.is_partitioned() {
        let mut hasher = Sha256::new();
        hasher.update(ctx.partition_value().as_bytes());
        let partition_hash = hex::encode(hasher.finalize());
        format!("{}/{}/{}", remote.name, normalized_path, partition_hash)
    } else {
        format!("{}/{}", remote.name, normalized_path)
    };

    CacheKey {
        storage_key,
        normalized_path,
    }
}

/// Strip the remote's URI prefix, or the scheme and host of any other
/// absolute URL, then trim leading slashes.
fn normalize_path(remote_uri: &str, path: &str) -> String {
    let root = remote_uri.trim_end_matches('/');

    let stripped = if !root.is_empty() && path.starts_with(root) {
        &path[root.len()..]
    } else if let Ok(url) = reqwest::Url::parse(path) {
        match url.scheme() {
            "http" | "https" => return url.path().trim_start_matches('/').to_string(),
            _ => path,
        }
    } else {
        path
    };

    stripped.trim_start_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
