//! The durable local index.
//!
//! A cache of everything the client knows about each logical path: last
//! seen local mtime/size/hash, last pushed and pulled versions, access
//! rights. The index is written atomically (temp file + rename) and is
//! *not* authoritative: after corruption or loss a full rescan rebuilds
//! it from the local tree and the relay snapshot, at the cost of one
//! extra round of digest comparisons.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use escale_types::{AccessRights, Digest, LogicalPath, Version};

/// Index schema version; bumped on incompatible layout changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Everything known about one logical path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    /// Local file mtime (unix seconds) at last reconciliation.
    pub mtime_secs: Option<i64>,
    /// Local file size at last reconciliation.
    pub size: Option<u64>,
    /// Local plaintext hash; `None` when the local file is gone.
    pub hash: Option<Digest>,
    /// Highest version this client has pushed for the path.
    pub last_pushed: Version,
    /// Highest version this client has pulled for the path.
    pub last_pulled: Version,
    /// Hash of the content last pulled (deletion propagation check).
    pub last_pulled_hash: Option<Digest>,
    /// Access rights for this path.
    pub rights: AccessRights,
}

impl IndexEntry {
    /// The highest version this client has seen for the path.
    pub fn last_seen(&self) -> Version {
        self.last_pushed.max(self.last_pulled)
    }
}

/// The per-repository index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    /// Schema version of this file.
    pub schema_version: u32,
    /// Unix seconds of the last completed full scan.
    pub last_full_scan: Option<u64>,
    /// Per-path state.
    pub entries: BTreeMap<LogicalPath, IndexEntry>,
    /// Side table mapping hashed relay base names to logical paths
    /// (names too long for the backend after escaping).
    pub long_names: BTreeMap<String, LogicalPath>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            last_full_scan: None,
            entries: BTreeMap::new(),
            long_names: BTreeMap::new(),
        }
    }
}

impl Index {
    /// Load the index, falling back to an empty one when the file is
    /// missing, corrupt or from an incompatible schema. The fallback is
    /// safe because the index is a cache; a rescan rebuilds it.
    pub async fn load(path: &Path) -> Self {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!("unreadable index {}: {e}; rebuilding", path.display());
                return Self::default();
            }
        };
        match serde_json::from_str::<Self>(&contents) {
            Ok(index) if index.schema_version == SCHEMA_VERSION => index,
            Ok(index) => {
                tracing::warn!(
                    "index schema {} != {SCHEMA_VERSION}; rebuilding",
                    index.schema_version
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!("corrupt index {}: {e}; rebuilding", path.display());
                Self::default()
            }
        }
    }

    /// Persist the index atomically (write temp, rename into place).
    pub async fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Entry for a path, inserting a default if absent.
    pub fn entry_mut(&mut self, path: &LogicalPath) -> &mut IndexEntry {
        self.entries.entry(path.clone()).or_default()
    }

    /// Entry for a path, if known.
    pub fn entry(&self, path: &LogicalPath) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    /// Record a hashed relay base name so listings can be resolved.
    pub fn record_long_name(&mut self, base: String, path: LogicalPath) {
        self.long_names.insert(base, path);
    }

    /// Resolve a hashed relay base name.
    pub fn resolve_long_name(&self, base: &str) -> Option<&LogicalPath> {
        self.long_names.get(base)
    }
}
