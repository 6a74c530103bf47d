//! Per-remote request policy: allow/block patterns and cacheability rules.
//!
//! The cacheability rules encode one domain fact: mutable index and metadata
//! files must always be fetched live, while immutable content-addressed blobs
//! may be cached indefinitely.

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::{Archetype, SecurityConfig};

// ---------------------------------------------------------------------------
// Enforcer
// ---------------------------------------------------------------------------

/// Compiled policy for one remote.  Patterns are compiled once here; an
/// invalid pattern aborts startup.
pub struct Enforcer {
    archetype: Archetype,
    allowed: Vec<Regex>,
    blocked: Vec<Regex>,
}

impl Enforcer {
    pub fn new(archetype: Archetype, security: &SecurityConfig) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p).with_context(|| format!("invalid security pattern {p:?}")))
                .collect()
        };
        Ok(Self {
            archetype,
            allowed: compile(&security.allowed_patterns)?,
            blocked: compile(&security.blocked_patterns)?,
        })
    }

    /// Whether this remote may serve `path` at all.
    ///
    /// Block patterns win over everything; a non-empty allow-list then
    /// requires at least one match; an empty allow-list admits every
    /// non-blocked path.
    pub fn can_receive(&self, path: &str) -> bool {
        if self.blocked.iter().any(|re| re.is_match(path)) {
            return false;
        }
        if self.allowed.is_empty() {
            return true;
        }
        self.allowed.iter().any(|re| re.is_match(path))
    }

    /// Whether a response for `path` may be persisted and replayed.
    ///
    /// Pure: depends only on the remote's archetype and the path's final
    /// segment, never on I/O.
    pub fn can_cache(&self, path: &str) -> bool {
        let filename = path.rsplit('/').next().unwrap_or(path);
        match self.archetype {
            Archetype::Npm => filename.ends_with(".tgz"),
            Archetype::Maven => filename != "maven-metadata.xml",
            Archetype::Alpine => filename != "APKINDEX.tar.gz",
            Archetype::Debian => filename.ends_with(".deb") || filename.ends_with(".tar.gz"),
            Archetype::Helm => filename.ends_with(".tgz") || filename.ends_with(".tgz.prov"),
            Archetype::Generic | Archetype::Go | Archetype::Rust | Archetype::Pip => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer(archetype: Archetype) -> Enforcer {
        Enforcer::new(archetype, &SecurityConfig::default()).unwrap()
    }

    fn enforcer_with(
        archetype: Archetype,
        allowed: &[&str],
        blocked: &[&str],
    ) -> Enforcer {
        let security = SecurityConfig {
            allowed_patterns: allowed.iter().map(|s| s.to_string()).collect(),
            blocked_patterns: blocked.iter().map(|s| s.to_string()).collect(),
            ..SecurityConfig::default()
        };
        Enforcer::new(archetype, &security).unwrap()
    }

    // ── can_cache per archetype ─────────────────────────────────────────

    #[test]
    fn npm_caches_only_tarballs() {
        let e = enforcer(Archetype::Npm);
        assert!(e.can_cache("lodash/-/lodash-4.17.21.tgz"));
        assert!(!e.can_cache("lodash/metadata.json"));
        assert!(!e.can_cache("lodash"));
    }

    #[test]
    fn maven_excludes_metadata() {
        let e = enforcer(Archetype::Maven);
        assert!(e.can_cache("com/acme/lib/1.0/lib.jar"));
        assert!(e.can_cache("com/acme/lib/1.0/lib-1.0.pom"));
        assert!(!e.can_cache("com/acme/lib/maven-metadata.xml"));
        // Only the exact metadata filename is live-only.
        assert!(e.can_cache("com/acme/not-maven-metadata.xml"));
    }

    #[test]
    fn alpine_excludes_apkindex() {
        let e = enforcer(Archetype::Alpine);
        assert!(!e.can_cache("v3.20/main/x86_64/APKINDEX.tar.gz"));
        assert!(e.can_cache("v3.20/main/x86_64/curl-8.9.0-r0.apk"));
    }

    #[test]
    fn debian_caches_packages_and_tarballs() {
        let e = enforcer(Archetype::Debian);
        assert!(e.can_cache("pool/main/c/curl/curl_8.9.0_amd64.deb"));
        assert!(e.can_cache("pool/main/c/curl/curl_8.9.0.orig.tar.gz"));
        assert!(!e.can_cache("dists/stable/main/binary-amd64/Packages.gz"));
    }

    #[test]
    fn helm_caches_charts_and_provenance() {
        let e = enforcer(Archetype::Helm);
        assert!(e.can_cache("charts/nginx-1.2.3.tgz"));
        assert!(e.can_cache("charts/nginx-1.2.3.tgz.prov"));
        assert!(!e.can_cache("index.yaml"));
    }

    #[test]
    fn generic_archetypes_cache_everything() {
        for archetype in [Archetype::Generic, Archetype::Go, Archetype::Rust, Archetype::Pip] {
            let e = enforcer(archetype);
            assert!(e.can_cache("anything/at/all.bin"), "{archetype:?}");
        }
    }

    // ── can_receive ─────────────────────────────────────────────────────

    #[test]
    fn block_pattern_rejects() {
        let e = enforcer_with(Archetype::Generic, &[], &["^/?(super-secret).+"]);
        assert!(!e.can_receive("super-secret/file.txt"));
        assert!(!e.can_receive("/super-secret/file.txt"));
        assert!(e.can_receive("public/file.txt"));
    }

    #[test]
    fn allow_list_restricts_when_non_empty() {
        let e = enforcer_with(Archetype::Generic, &["^releases/"], &[]);
        assert!(e.can_receive("releases/v1/app.tar.gz"));
        assert!(!e.can_receive("snapshots/v1/app.tar.gz"));
    }

    #[test]
    fn block_wins_over_allow() {
        let e = enforcer_with(Archetype::Generic, &["^releases/"], &["secret"]);
        assert!(!e.can_receive("releases/secret/app.tar.gz"));
    }

    #[test]
    fn empty_policy_admits_everything() {
        let e = enforcer(Archetype::Generic);
        assert!(e.can_receive("any/path.bin"));
    }

    #[test]
    fn invalid_pattern_fails_construction() {
        let security = SecurityConfig {
            blocked_patterns: vec!["([unclosed".to_string()],
            ..SecurityConfig::default()
        };
        assert!(Enforcer::new(Archetype::Generic, &security).is_err());
    }
}
