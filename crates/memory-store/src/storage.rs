//! File-backed storage: one item per file.
//!
//! Writes go to a temporary file in the store root and are renamed over the
//! target, so a reader always sees either the previous or the new complete
//! value. Prior versions rotate through `backups/<id>.backup.<n><ext>`.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::backend::{Record, StorageBackend, StorageStats};
use crate::cache::TtlCache;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

const PLAIN_EXTENSION: &str = ".json";
const COMPRESSED_EXTENSION: &str = ".json.gz";
const BACKUP_DIR: &str = "backups";

/// A retained prior version of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// 1 = most recent
    pub slot: usize,
    pub path: Utf8PathBuf,
    pub bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// File-backed store with per-id locking, a TTL cache and rotating backups.
#[derive(Debug)]
pub struct FileStore {
    config: StoreConfig,
    /// Per-id locks; the outer mutex only guards creation/lookup.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cache: TtlCache,
}

impl FileStore {
    /// Open a store, creating its directories if needed.
    pub fn new(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root).map_err(|e| StoreError::io(&config.root, e))?;
        let store = Self {
            cache: TtlCache::new(config.cache_ttl()),
            locks: Mutex::new(HashMap::new()),
            config,
        };
        if store.backups_enabled() {
            let dir = store.backup_dir();
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(dir, e))?;
        }
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn root(&self) -> &Utf8Path {
        &self.config.root
    }

    fn extension(&self) -> &'static str {
        if self.config.compression {
            COMPRESSED_EXTENSION
        } else {
            PLAIN_EXTENSION
        }
    }

    fn backups_enabled(&self) -> bool {
        self.config.backups && self.config.max_backup_files > 0
    }

    /// Path of the live file for `id`.
    pub fn item_path(&self, id: &str) -> Utf8PathBuf {
        self.config.root.join(format!("{}{}", id, self.extension()))
    }

    fn backup_dir(&self) -> Utf8PathBuf {
        self.config.root.join(BACKUP_DIR)
    }

    /// Path of backup slot `slot` for `id`.
    pub fn backup_path(&self, id: &str, slot: usize) -> Utf8PathBuf {
        self.backup_dir()
            .join(format!("{}.backup.{}{}", id, slot, self.extension()))
    }

    /// Lock for `id`. Entries no caller holds are dropped from the registry.
    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(id.to_string()).or_default().clone()
    }

    #[cfg(test)]
    fn registered_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn encode(&self, id: &str, data: &Record) -> Result<Vec<u8>> {
        let json = serde_json::to_vec_pretty(data).map_err(|source| StoreError::Serialization {
            id: id.to_string(),
            source,
        })?;
        if !self.config.compression {
            return Ok(json);
        }

        let path = self.item_path(id);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| StoreError::io(&path, e))?;
        encoder.finish().map_err(|e| StoreError::io(path, e))
    }

    fn decode(&self, id: &str, bytes: Vec<u8>) -> Result<Record> {
        let json = if self.config.compression {
            let mut decompressed = Vec::new();
            GzDecoder::new(&bytes[..])
                .read_to_end(&mut decompressed)
                .map_err(|e| StoreError::io(self.item_path(id), e))?;
            decompressed
        } else {
            bytes
        };

        serde_json::from_slice(&json).map_err(|source| StoreError::Serialization {
            id: id.to_string(),
            source,
        })
    }

    /// Write `bytes` to `<root>/<id>.tmp.<random>` and rename it over `target`.
    ///
    /// The temporary file is removed on every failure path.
    fn write_atomic(&self, id: &str, target: &Utf8Path, bytes: &[u8]) -> Result<()> {
        let mut temp = tempfile::Builder::new()
            .prefix(&format!("{}.tmp.", id))
            .tempfile_in(&self.config.root)
            .map_err(|e| StoreError::io(&self.config.root, e))?;

        temp.write_all(bytes).map_err(|e| StoreError::io(target, e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io(target, e))?;
        temp.persist(target)
            .map_err(|e| StoreError::io(target, e.error))?;
        Ok(())
    }

    /// Rotate backups and copy the current file into slot 1.
    ///
    /// Caller must hold the lock for `id`.
    fn create_backup(&self, id: &str) -> Result<()> {
        if !self.backups_enabled() {
            return Ok(());
        }
        let source = self.item_path(id);
        if !source.exists() {
            return Ok(());
        }

        let dir = self.backup_dir();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let max = self.config.max_backup_files;
        self.prune_backups_beyond(id, max)?;

        for slot in (1..max).rev() {
            let from = self.backup_path(id, slot);
            if !from.exists() {
                continue;
            }
            let to = self.backup_path(id, slot + 1);
            remove_if_exists(&to)?;
            fs::rename(&from, &to).map_err(|e| StoreError::io(&from, e))?;
        }

        let first = self.backup_path(id, 1);
        remove_if_exists(&first)?;
        fs::copy(&source, &first).map_err(|e| StoreError::io(&first, e))?;
        debug!(id, path = %first, "backup created");
        Ok(())
    }

    /// Remove slots numbered above `max`, left over from a deeper configuration.
    fn prune_backups_beyond(&self, id: &str, max: usize) -> Result<()> {
        let mut slot = max + 1;
        loop {
            let path = self.backup_path(id, slot);
            if !path.exists() {
                return Ok(());
            }
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            debug!(id, slot, "pruned excess backup");
            slot += 1;
        }
    }

    fn try_save(&self, id: &str, data: &Record) -> Result<()> {
        validate_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = self.create_backup(id) {
            warn!(id, error = %e, "backup rotation failed, writing anyway");
        }

        let bytes = self.encode(id, data)?;
        self.write_atomic(id, &self.item_path(id), &bytes)?;
        self.cache.put(id, data.clone());
        debug!(id, bytes = bytes.len(), "item saved");
        Ok(())
    }

    fn try_load(&self, id: &str) -> Result<Option<Record>> {
        validate_id(id)?;
        if let Some(hit) = self.cache.get(id) {
            return Ok(Some(hit));
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.item_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let record = self.decode(id, bytes)?;
        self.cache.put(id, record.clone());
        debug!(id, "item loaded from disk");
        Ok(Some(record))
    }

    fn try_delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.item_path(id);
        if path.exists() {
            if let Err(e) = self.create_backup(id) {
                warn!(id, error = %e, "final backup failed, deleting anyway");
            }
            remove_if_exists(&path)?;
            debug!(id, "item deleted");
        }
        self.cache.invalidate(id);
        Ok(())
    }

    /// Copy backup `slot` over the live file for `id`.
    pub fn restore_from_backup(&self, id: &str, slot: usize) -> Result<()> {
        validate_id(id)?;
        if !self.backups_enabled() {
            return Err(StoreError::BackupsDisabled(self.config.root.clone()));
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let backup = self.backup_path(id, slot);
        if slot == 0 || !backup.exists() {
            return Err(StoreError::MissingBackup {
                id: id.to_string(),
                slot,
            });
        }

        let bytes = fs::read(&backup).map_err(|e| StoreError::io(&backup, e))?;
        self.write_atomic(id, &self.item_path(id), &bytes)?;
        self.cache.invalidate(id);
        info!(id, slot, "item restored from backup");
        Ok(())
    }

    /// Backups currently retained for `id`, most recent first.
    pub fn list_backups(&self, id: &str) -> Result<Vec<BackupInfo>> {
        validate_id(id)?;
        if !self.backups_enabled() {
            return Ok(Vec::new());
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut backups = Vec::new();
        for slot in 1..=self.config.max_backup_files {
            let path = self.backup_path(id, slot);
            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            backups.push(BackupInfo {
                slot,
                bytes: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                path,
            });
        }
        Ok(backups)
    }

    /// Evict every expired cache entry. Returns the number evicted.
    pub fn cleanup_cache(&self) -> usize {
        let evicted = self.cache.evict_expired();
        if evicted > 0 {
            debug!(root = %self.config.root, evicted, "cache swept");
        }
        evicted
    }

    /// Bypass the cache until the returned scope is dropped.
    ///
    /// Every read inside the scope hits disk. The whole cache is cleared when
    /// the scope ends, on every exit path.
    pub fn batch(&self) -> BatchScope<'_> {
        self.cache.suspend();
        BatchScope { store: self }
    }

    /// Sum of file count and bytes for entries in `dir` ending with `suffix`.
    fn tally(&self, dir: &Utf8Path, suffix: &str) -> (usize, u64) {
        let Ok(entries) = fs::read_dir(dir) else {
            return (0, 0);
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(suffix))
            })
            .filter_map(|entry| entry.metadata().ok())
            .filter(|metadata| metadata.is_file())
            .fold((0, 0), |(count, bytes), metadata| {
                (count + 1, bytes + metadata.len())
            })
    }
}

impl StorageBackend for FileStore {
    fn save(&self, id: &str, data: &Record) -> bool {
        match self.try_save(id, data) {
            Ok(()) => true,
            Err(e) => {
                warn!(id, error = %e, "failed to save item");
                false
            }
        }
    }

    fn load(&self, id: &str) -> Option<Record> {
        match self.try_load(id) {
            Ok(record) => record,
            Err(e) => {
                warn!(id, error = %e, "failed to load item");
                None
            }
        }
    }

    fn delete(&self, id: &str) -> bool {
        match self.try_delete(id) {
            Ok(()) => true,
            Err(e) => {
                warn!(id, error = %e, "failed to delete item");
                false
            }
        }
    }

    fn list(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.config.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.config.root, error = %e, "failed to list items");
                return Vec::new();
            }
        };

        let extension = self.extension();
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.strip_suffix(extension).map(str::to_string)
            })
            .filter(|id| validate_id(id).is_ok())
            .collect();
        ids.sort();
        ids
    }

    fn exists(&self, id: &str) -> bool {
        validate_id(id).is_ok() && self.item_path(id).is_file()
    }

    fn describe(&self) -> StorageStats {
        let extension = self.extension();
        let (item_count, total_bytes) = self.tally(&self.config.root, extension);
        let (backup_count, backup_bytes) = self.tally(&self.backup_dir(), extension);

        StorageStats {
            root: self.config.root.clone(),
            item_count,
            total_bytes,
            backup_count,
            backup_bytes,
            compression: self.config.compression,
            backups: self.config.backups,
            max_backup_files: self.config.max_backup_files,
            cache_entries: self.cache.len(),
            cache_ttl_ms: u64::try_from(self.cache.ttl().as_millis()).unwrap_or(u64::MAX),
            available_bytes: fs2::available_space(&self.config.root).ok(),
        }
    }
}

/// Scope during which a store's cache is bypassed; see [`FileStore::batch`].
#[derive(Debug)]
pub struct BatchScope<'a> {
    store: &'a FileStore,
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        self.store.cache.resume();
        debug!(root = %self.store.config.root, "batch scope closed, cache cleared");
    }
}

/// Reject ids that are empty or could escape the store root.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    let invalid = id.is_empty()
        || id == "."
        || id.contains("..")
        || id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn remove_if_exists(path: &Utf8Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tempfile::tempdir;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn store_in(
        dir: &tempfile::TempDir,
        config: impl FnOnce(StoreConfig) -> StoreConfig,
    ) -> FileStore {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        FileStore::new(config(StoreConfig::new(root))).unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir, |c| c);

        let data = record(json!({"text": "hello", "nested": {"n": [1, 2, 3]}}));
        assert!(store.save("item-1", &data));
        assert_eq!(store.load("item-1"), Some(data));
        assert!(store.item_path("item-1").as_str().ends_with("item-1.json"));
    }

    #[test]
    fn test_compressed_file_is_gzip() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir, |c| c.with_compression(true));

        assert!(store.save("packed", &record(json!({"k": "v"}))));
        let bytes = fs::read(store.item_path("packed")).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir, |c| c.with_backups(None));

        for i in 0..5 {
            assert!(store.save("busy", &record(json!({"i": i}))));
        }
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["busy.json".to_string()]);
    }

    #[test]
    fn test_invalid_ids_are_refused() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir, |c| c);
        let data = record(json!({}));

        assert!(!store.save("", &data));
        assert!(!store.save("../escape", &data));
        assert!(!store.save("a/b", &data));
        assert!(!store.exists("../escape"));
        assert!(matches!(
            store.restore_from_backup("a/b", 1),
            Err(StoreError::InvalidId(_))
        ));
    }

    #[test]
    fn test_corrupt_file_reads_as_absent() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir, |c| c.with_cache_ttl(Duration::ZERO));

        fs::write(store.item_path("broken"), "{not json").unwrap();
        assert_eq!(store.load("broken"), None);
        assert!(store.exists("broken"));
    }

    #[test]
    fn test_delete_keeps_final_backup() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir, |c| c.with_backups(Some(3)));

        assert!(store.save("gone", &record(json!({"v": 1}))));
        assert!(store.delete("gone"));
        assert!(!store.exists("gone"));

        let backups = store.list_backups("gone").unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].slot, 1);
    }

    #[test]
    fn test_excess_backups_are_pruned() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let deep = FileStore::new(StoreConfig::new(root.clone()).with_backups(Some(4))).unwrap();
        for i in 0..5 {
            assert!(deep.save("doc", &record(json!({"v": i}))));
        }
        assert_eq!(deep.list_backups("doc").unwrap().len(), 4);

        let shallow = FileStore::new(StoreConfig::new(root).with_backups(Some(2))).unwrap();
        assert!(shallow.save("doc", &record(json!({"v": 5}))));
        assert!(!shallow.backup_path("doc", 3).exists());
        assert!(!shallow.backup_path("doc", 4).exists());
        assert_eq!(shallow.list_backups("doc").unwrap().len(), 2);
    }

    #[test]
    fn test_restore_requires_backups() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir, |c| c.with_backups(None));

        assert!(store.save("x", &record(json!({"v": 1}))));
        assert!(matches!(
            store.restore_from_backup("x", 1),
            Err(StoreError::BackupsDisabled(_))
        ));
    }

    #[test]
    fn test_returned_values_are_copies() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir, |c| c);

        assert!(store.save("shared", &record(json!({"v": 1}))));
        let mut first = store.load("shared").unwrap();
        first.insert("v".to_string(), json!(99));

        assert_eq!(store.load("shared").unwrap()["v"], json!(1));
    }

    #[test]
    fn test_lock_registry_does_not_grow_with_ids() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir, |c| c.with_backups(None));

        for i in 0..100 {
            assert!(store.save(&format!("item-{i}"), &record(json!({"i": i}))));
        }
        assert!(store.load("item-7").is_some());
        assert!(store.delete("item-8"));
        assert!(store.registered_locks() <= 1);

        let held = store.lock_for("pinned");
        assert!(store.save("other", &record(json!({}))));
        let again = store.lock_for("pinned");
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[test]
    fn test_describe_counts_items_and_backups() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir, |c| c.with_backups(Some(2)));

        assert!(store.save("a", &record(json!({"v": 1}))));
        assert!(store.save("a", &record(json!({"v": 2}))));
        assert!(store.save("b", &record(json!({"v": 3}))));

        let stats = store.describe();
        assert_eq!(stats.item_count, 2);
        assert_eq!(stats.backup_count, 1);
        assert!(stats.total_bytes > 0);
        assert!(stats.backups);
        assert_eq!(stats.max_backup_files, 2);
    }
}
