use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::request::AuthMode;

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Package ecosystem served by a remote or refraction.
///
/// The archetype is immutable for the lifetime of a remote: it selects the
/// upstream client variant (plain HTTP, Helm index, PyPI index) and the
/// cacheability rules, and changing it under an existing cache would corrupt
/// key semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Archetype {
    /// Opaque files, everything cacheable.
    #[default]
    Generic,
    Maven,
    Go,
    Npm,
    Alpine,
    Helm,
    Rust,
    Debian,
    Pip,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub resolve: ResolveConfig,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub index: IndexConfig,
    pub remotes: Vec<RemoteConfig>,
    pub refractions: Vec<RefractionConfig>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendType,
    pub s3: Option<S3StorageConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendType {
    #[default]
    S3,
    /// In-process map; development and tests only.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    pub region: String,
    /// Use the FIPS endpoints for S3 operations.
    #[serde(default)]
    pub use_fips: bool,
}

fn default_s3_prefix() -> String {
    "pkgcache/".to_string()
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveConfig {
    /// Deadline (seconds) shared by all existence probes of one request.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    /// Entry bound for each remote's existence-probe cache.
    #[serde(default = "default_probe_cache_capacity")]
    pub probe_cache_capacity: u64,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout(),
            probe_cache_capacity: default_probe_cache_capacity(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_probe_cache_capacity() -> u64 {
    10_000
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
    #[serde(default)]
    pub strategy: PartitionStrategy,
    /// Header name whose presence activates token-to-identity exchange.
    #[serde(default = "default_trigger_header")]
    pub trigger_header: String,
    /// Entry bound for the token-to-identity cache.
    #[serde(default = "default_partition_cache_capacity")]
    pub cache_capacity: u64,
    /// TTL (seconds) for resolved identities; expiry re-resolves silently.
    #[serde(default = "default_partition_cache_ttl")]
    pub cache_ttl: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            strategy: PartitionStrategy::default(),
            trigger_header: default_trigger_header(),
            cache_capacity: default_partition_cache_capacity(),
            cache_ttl: default_partition_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// Partition by the raw token only; no identity exchange.
    #[default]
    None,
    /// Exchange CI job tokens for a stable user id via the remote's API.
    JobToken,
}

fn default_trigger_header() -> String {
    "JOB-TOKEN".to_string()
}

fn default_partition_cache_capacity() -> u64 {
    10_000
}

fn default_partition_cache_ttl() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Package index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexConfig {
    /// Optional JSON file (`{"filename": "absolute-url", ...}`) loaded into
    /// the in-memory package index at startup.
    pub preload: Option<String>,
}

// ---------------------------------------------------------------------------
// Remotes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Stable numeric id recorded with artifact-access events.
    pub id: i64,
    /// Unique name; doubles as the top-level storage-key namespace.
    pub name: String,
    /// Upstream base URI (e.g. `https://registry.npmjs.org`).
    pub uri: String,
    pub archetype: Archetype,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// When non-empty, a path must match at least one of these to be served.
    pub allowed_patterns: Vec<String>,
    /// A path matching any of these is rejected outright.
    pub blocked_patterns: Vec<String>,
    /// Inbound header names this remote recognises as credentials.
    pub auth_headers: Vec<String>,
    /// What the upstream requires; `none` strips caller credentials from
    /// downloads and keeps the cache unpartitioned.
    pub auth_mode: AuthMode,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_patterns: Vec::new(),
            blocked_patterns: Vec::new(),
            auth_headers: vec!["Authorization".to_string(), "JOB-TOKEN".to_string()],
            auth_mode: AuthMode::None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// PEM file with an additional root CA to trust.
    pub ca_file: Option<String>,
    /// PEM file with a client certificate presented to the upstream.
    pub client_cert_file: Option<String>,
    /// PEM file with the private key for `client_cert_file`.
    pub client_key_file: Option<String>,
    /// Outbound proxy URL for this remote.
    pub proxy_url: Option<String>,
    /// Disable upstream certificate verification.
    pub skip_tls_verify: bool,
    /// Idle-connection bound per upstream host.
    pub max_idle_per_host: Option<usize>,
}

// ---------------------------------------------------------------------------
// Refractions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RefractionConfig {
    /// Unique name; the externally visible repository bucket.
    pub name: String,
    pub archetype: Archetype,
    /// Member remote names.  All members are probed on every request; the
    /// order here never affects which answer wins.
    pub remotes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.storage.backend != StorageBackendType::S3 || config.storage.s3.is_some(),
        "storage.backend is s3 but the storage.s3 section is missing"
    );
    anyhow::ensure!(config.resolve.probe_timeout > 0, "resolve.probe_timeout must be positive");
    anyhow::ensure!(config.partition.cache_ttl > 0, "partition.cache_ttl must be positive");

    let mut remote_names = HashSet::new();
    for remote in &config.remotes {
        anyhow::ensure!(!remote.name.is_empty(), "remote name must not be empty");
        anyhow::ensure!(!remote.name.contains('/'), "remote name must not contain '/': {}", remote.name);
        anyhow::ensure!(
            remote_names.insert(remote.name.as_str()),
            "duplicate remote name: {}",
            remote.name
        );
        anyhow::ensure!(!remote.uri.is_empty(), "remote {} has an empty uri", remote.name);
        for pattern in remote
            .security
            .allowed_patterns
            .iter()
            .chain(remote.security.blocked_patterns.iter())
        {
            Regex::new(pattern).with_context(|| {
                format!("remote {}: invalid security pattern {pattern:?}", remote.name)
            })?;
        }
    }

    let mut refraction_names = HashSet::new();
    for refraction in &config.refractions {
        anyhow::ensure!(
            refraction_names.insert(refraction.name.as_str()),
            "duplicate refraction name: {}",
            refraction.name
        );
        anyhow::ensure!(
            !refraction.remotes.is_empty(),
            "refraction {} has no member remotes",
            refraction.name
        );
        for member in &refraction.remotes {
            let remote = config
                .remotes
                .iter()
                .find(|r| &r.name == member)
                .with_context(|| {
                    format!("refraction {} references unknown remote {member}", refraction.name)
                })?;
            anyhow::ensure!(
                refraction.archetype == Archetype::Generic || remote.archetype == refraction.archetype,
                "refraction {} ({:?}) cannot aggregate remote {} ({:?})",
                refraction.name,
                refraction.archetype,
                remote.name,
                remote.archetype
            );
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
server:
  http_listen: "127.0.0.1:8080"
storage:
  backend: memory
remotes:
  - id: 1
    name: npmjs
    uri: https://registry.npmjs.org
    archetype: npm
refractions:
  - name: npm-all
    archetype: npm
    remotes: [npmjs]
"#
    }

    #[test]
    fn minimal_config_parses_and_validates() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.remotes[0].archetype, Archetype::Npm);
        assert_eq!(config.resolve.probe_timeout, 10);
        assert_eq!(config.partition.trigger_header, "JOB-TOKEN");
    }

    #[test]
    fn unknown_member_is_rejected() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.refractions[0].remotes.push("ghost".to_string());
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("unknown remote"));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.remotes[0].security.blocked_patterns.push("([unclosed".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn archetype_mismatch_is_rejected() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.refractions[0].archetype = Archetype::Pip;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("cannot aggregate"));
    }

    #[test]
    fn s3_backend_requires_section() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.storage.backend = StorageBackendType::S3;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn duplicate_remote_name_is_rejected() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        let dup = config.remotes[0].clone();
        config.remotes.push(dup);
        assert!(validate_config(&config).is_err());
    }
}
