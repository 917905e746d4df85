//! Per-layer storage policies.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::layered::Layer;

/// Default cache freshness window, in milliseconds.
pub const DEFAULT_CACHE_TTL_MS: u64 = 300_000;

/// Policy for a single file-backed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one file per item
    pub root: Utf8PathBuf,

    /// Gzip item files (`.json.gz`)
    #[serde(default)]
    pub compression: bool,

    /// Keep rotating backups of prior versions
    #[serde(default = "default_backups")]
    pub backups: bool,

    /// Number of prior versions retained per item
    #[serde(default = "default_max_backup_files")]
    pub max_backup_files: usize,

    /// Cache freshness window in milliseconds (0 disables caching)
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

fn default_backups() -> bool {
    true
}

fn default_max_backup_files() -> usize {
    5
}

fn default_cache_ttl_ms() -> u64 {
    DEFAULT_CACHE_TTL_MS
}

impl StoreConfig {
    /// Plain store with backups at the default depth.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            compression: false,
            backups: default_backups(),
            max_backup_files: default_max_backup_files(),
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
        }
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Enable backups with the given depth, or disable them with `None`.
    pub fn with_backups(mut self, max_backup_files: Option<usize>) -> Self {
        match max_backup_files {
            Some(max) => {
                self.backups = true;
                self.max_backup_files = max;
            }
            None => self.backups = false,
        }
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Default policy for a layer rooted at `root`.
    pub fn for_layer(layer: Layer, root: impl Into<Utf8PathBuf>) -> Self {
        let config = Self::new(root);
        match layer {
            Layer::Global => config.with_compression(true).with_backups(Some(10)),
            Layer::Project => config.with_compression(false).with_backups(Some(5)),
            Layer::Session => config.with_compression(false).with_backups(None),
        }
    }
}

/// Configuration of the three storage layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayeredConfig {
    pub global: StoreConfig,
    pub project: StoreConfig,
    pub session: StoreConfig,
}

/// On-disk shape of a layered configuration file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct LayeredConfigFile {
    base: Option<Utf8PathBuf>,
    #[serde(default)]
    global: Option<serde_json::Value>,
    #[serde(default)]
    project: Option<serde_json::Value>,
    #[serde(default)]
    session: Option<serde_json::Value>,
}

impl LayeredConfig {
    /// Default policies under `<base>/{global,project,session}`.
    pub fn under(base: impl AsRef<Utf8Path>) -> Self {
        let base = base.as_ref();
        Self {
            global: StoreConfig::for_layer(Layer::Global, base.join("global")),
            project: StoreConfig::for_layer(Layer::Project, base.join("project")),
            session: StoreConfig::for_layer(Layer::Session, base.join("session")),
        }
    }

    /// Default policies under the default base directory.
    pub fn default_location() -> Self {
        Self::under(memory_common::default_store_base())
    }

    /// Load a JSON configuration file.
    ///
    /// Layers absent from the file keep their defaults; fields absent from a
    /// layer's object fall back to that layer's default policy.
    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let file: LayeredConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        let mut config = match &file.base {
            Some(base) => Self::under(base),
            None => Self::default_location(),
        };

        config.global = merge_layer(config.global, file.global)
            .with_context(|| format!("Invalid global layer in {}", path))?;
        config.project = merge_layer(config.project, file.project)
            .with_context(|| format!("Invalid project layer in {}", path))?;
        config.session = merge_layer(config.session, file.session)
            .with_context(|| format!("Invalid session layer in {}", path))?;

        Ok(config)
    }

    pub fn get(&self, layer: Layer) -> &StoreConfig {
        match layer {
            Layer::Global => &self.global,
            Layer::Project => &self.project,
            Layer::Session => &self.session,
        }
    }
}

impl Default for LayeredConfig {
    fn default() -> Self {
        Self::default_location()
    }
}

/// Overlay the fields present in `overrides` on top of `base`.
fn merge_layer(base: StoreConfig, overrides: Option<serde_json::Value>) -> Result<StoreConfig> {
    let Some(serde_json::Value::Object(overrides)) = overrides else {
        return Ok(base);
    };

    let mut merged = match serde_json::to_value(&base)? {
        serde_json::Value::Object(map) => map,
        _ => anyhow::bail!("store config did not serialize to an object"),
    };
    merged.extend(overrides);

    Ok(serde_json::from_value(serde_json::Value::Object(merged))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layer_defaults() {
        let config = LayeredConfig::under("/data/memory");

        assert_eq!(config.global.root, "/data/memory/global");
        assert!(config.global.compression);
        assert_eq!(config.global.max_backup_files, 10);

        assert!(!config.project.compression);
        assert!(config.project.backups);
        assert_eq!(config.project.max_backup_files, 5);

        assert!(!config.session.backups);
        assert_eq!(config.session.cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_from_file_overrides_only_given_fields() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("layers.json")).unwrap();
        fs::write(
            &path,
            r#"{"base": "/srv/mem", "project": {"max_backup_files": 2, "cache_ttl_ms": 5000}}"#,
        )
        .unwrap();

        let config = LayeredConfig::from_file(&path).unwrap();
        assert_eq!(config.project.root, "/srv/mem/project");
        assert_eq!(config.project.max_backup_files, 2);
        assert_eq!(config.project.cache_ttl(), Duration::from_secs(5));
        assert!(config.project.backups);
        assert!(config.global.compression);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("layers.json")).unwrap();
        fs::write(&path, "not json").unwrap();

        assert!(LayeredConfig::from_file(&path).is_err());
    }
}
