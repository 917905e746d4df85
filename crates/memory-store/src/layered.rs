//! Three independently configured stores routed by layer name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::backend::{StorageBackend, StorageStats};
use crate::config::LayeredConfig;
use crate::error::{Result, StoreError};
use crate::item::MemoryItem;
use crate::storage::{BatchScope, FileStore, validate_id};

/// Storage namespace with its own durability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Long-lived, compressed, deep backups
    Global,
    /// Latency-sensitive, shallow backups
    Project,
    /// Ephemeral, no backups
    Session,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Global, Layer::Project, Layer::Session];

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Global => "global",
            Layer::Project => "project",
            Layer::Session => "session",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Layer::ALL
            .into_iter()
            .find(|layer| layer.as_str() == s)
            .ok_or_else(|| StoreError::UnknownLayer(s.to_string()))
    }
}

/// Aggregated statistics across layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayeredStats {
    pub layers: BTreeMap<Layer, StorageStats>,
    pub total_items: usize,
    pub total_bytes: u64,
    pub total_backup_bytes: u64,
}

/// Owns the global, project and session stores.
#[derive(Debug)]
pub struct LayeredStoreManager {
    stores: BTreeMap<Layer, FileStore>,
}

impl LayeredStoreManager {
    /// Open all three layers.
    pub fn new(config: LayeredConfig) -> Result<Self> {
        let mut stores = BTreeMap::new();
        for layer in Layer::ALL {
            let store = FileStore::new(config.get(layer).clone())?;
            debug!(%layer, root = %store.root(), "layer opened");
            stores.insert(layer, store);
        }
        Ok(Self { stores })
    }

    /// The store backing `layer`.
    pub fn layer(&self, layer: &str) -> Result<&FileStore> {
        let layer: Layer = layer.parse()?;
        self.stores
            .get(&layer)
            .ok_or_else(|| StoreError::UnknownLayer(layer.to_string()))
    }

    pub fn save(&self, layer: &str, item: &MemoryItem) -> Result<()> {
        let store = self.layer(layer)?;
        validate_id(&item.id)?;
        if store.save(&item.id, &item.to_record()) {
            Ok(())
        } else {
            Err(StoreError::WriteFailed {
                layer: layer.to_string(),
                id: item.id.clone(),
            })
        }
    }

    pub fn load(&self, layer: &str, id: &str) -> Result<Option<MemoryItem>> {
        let store = self.layer(layer)?;
        validate_id(id)?;
        Ok(store
            .load(id)
            .map(|record| MemoryItem::from_record(id, record)))
    }

    pub fn delete(&self, layer: &str, id: &str) -> Result<()> {
        let store = self.layer(layer)?;
        validate_id(id)?;
        if store.delete(id) {
            Ok(())
        } else {
            Err(StoreError::DeleteFailed {
                layer: layer.to_string(),
                id: id.to_string(),
            })
        }
    }

    pub fn list(&self, layer: &str) -> Result<Vec<String>> {
        Ok(self.layer(layer)?.list())
    }

    pub fn restore_from_backup(&self, layer: &str, id: &str, slot: usize) -> Result<()> {
        self.layer(layer)?.restore_from_backup(id, slot)
    }

    /// Per-layer `describe()` output plus grand totals.
    pub fn comprehensive_stats(&self) -> LayeredStats {
        let mut stats = LayeredStats::default();
        for (layer, store) in &self.stores {
            let layer_stats = store.describe();
            stats.total_items += layer_stats.item_count;
            stats.total_bytes += layer_stats.total_bytes;
            stats.total_backup_bytes += layer_stats.backup_bytes;
            stats.layers.insert(*layer, layer_stats);
        }
        stats
    }

    /// Sweep expired cache entries in every layer.
    pub fn cleanup_caches(&self) -> usize {
        self.stores.values().map(FileStore::cleanup_cache).sum()
    }

    /// Open a batch scope on the named layers (all layers when `None`).
    ///
    /// Names are validated before any scope is opened. Scopes close in reverse
    /// opening order when the returned guard is dropped.
    pub fn batch_operations(&self, layers: Option<&[&str]>) -> Result<LayeredBatch<'_>> {
        let selected: Vec<Layer> = match layers {
            Some(names) => names
                .iter()
                .map(|name| name.parse())
                .collect::<Result<_>>()?,
            None => Layer::ALL.to_vec(),
        };

        let mut scopes = Vec::with_capacity(selected.len());
        for layer in &selected {
            if let Some(store) = self.stores.get(layer) {
                scopes.push(store.batch());
            }
        }
        info!(layers = ?selected, "batch operations started");
        Ok(LayeredBatch {
            layers: selected,
            scopes,
        })
    }
}

/// Batch scopes across several layers; see [`LayeredStoreManager::batch_operations`].
#[derive(Debug)]
pub struct LayeredBatch<'a> {
    layers: Vec<Layer>,
    scopes: Vec<BatchScope<'a>>,
}

impl LayeredBatch<'_> {
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
}

impl Drop for LayeredBatch<'_> {
    fn drop(&mut self) {
        while let Some(scope) = self.scopes.pop() {
            drop(scope);
        }
        info!(layers = ?self.layers, "batch operations finished");
    }
}
