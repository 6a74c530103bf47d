//! Package metadata index consumed by the Helm and PyPI upstream variants.
//!
//! The index maps bare artifact filenames to absolute download URLs.  It is
//! populated by an external indexing process; this side only reads.  An
//! in-memory implementation ships for tests and single-node runs, optionally
//! preloaded from a JSON file at startup.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Read-only filename-to-URL lookup.  `Ok(None)` means the package is not
/// indexed (distinct from a backend fault).
#[async_trait]
pub trait PackageIndex: Send + Sync {
    async fn get_package(&self, filename: &str) -> Result<Option<String>>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryIndex {
    packages: RwLock<HashMap<String, String>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, filename: impl Into<String>, url: impl Into<String>) {
        self.packages
            .write()
            .await
            .insert(filename.into(), url.into());
    }

    /// Load `{"filename": "url", ...}` entries from a JSON file, merging over
    /// whatever is already present.
    pub async fn preload_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read index preload file: {}", path.display()))?;
        let entries: HashMap<String, String> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse index preload file: {}", path.display()))?;

        let count = entries.len();
        let mut packages = self.packages.write().await;
        packages.extend(entries);
        Ok(count)
    }
}

#[async_trait]
impl PackageIndex for MemoryIndex {
    async fn get_package(&self, filename: &str) -> Result<Option<String>> {
        Ok(self.packages.read().await.get(filename).cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
