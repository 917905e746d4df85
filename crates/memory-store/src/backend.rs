//! The storage contract every backing store satisfies.

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::{Map, Value};

/// A JSON mapping as persisted by a store.
pub type Record = Map<String, Value>;

/// Storage backend keyed by opaque string ids.
///
/// Operational failures (missing files, permissions, corrupt content, disk
/// errors) never escape: they are logged and surface as `false` or `None`.
pub trait StorageBackend: Send + Sync {
    /// Persist `data` under `id`.
    fn save(&self, id: &str, data: &Record) -> bool;

    /// The last successfully saved mapping, or `None`.
    fn load(&self, id: &str) -> Option<Record>;

    /// Remove `id`. Deleting a missing id succeeds.
    fn delete(&self, id: &str) -> bool;

    /// All stored ids in lexicographic order.
    fn list(&self) -> Vec<String>;

    fn exists(&self, id: &str) -> bool;

    fn describe(&self) -> StorageStats;
}

/// Statistics reported by [`StorageBackend::describe`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub root: Utf8PathBuf,
    pub item_count: usize,
    pub total_bytes: u64,
    pub backup_count: usize,
    pub backup_bytes: u64,
    pub compression: bool,
    pub backups: bool,
    pub max_backup_files: usize,
    pub cache_entries: usize,
    pub cache_ttl_ms: u64,
    /// Free space on the volume holding `root`, when it can be determined
    pub available_bytes: Option<u64>,
}
