//! The external memory save/recall contract, and an implementation over the
//! layered store.

use memory_store::{Layer, LayeredStoreManager, MemoryItem};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;

/// A record returned by [`MemoryBackend::recall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalledRecord {
    pub content: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Persist-by-key and query-by-filter.
pub trait MemoryBackend: Send + Sync {
    fn save(
        &self,
        content: &str,
        layer: &str,
        metadata: &Map<String, Value>,
        key: &str,
    ) -> Result<()>;

    fn recall(
        &self,
        query: &str,
        filters: &Map<String, Value>,
        limit: usize,
    ) -> Result<Vec<RecalledRecord>>;
}

/// [`MemoryBackend`] storing records as items in a [`LayeredStoreManager`].
///
/// Recognised filters:
/// - `key`: exact item id
/// - `layer`: restrict to one layer
/// - any other field: must equal the record's metadata field
///
/// Without a `key` filter, `query` matches item ids containing it or a
/// `task_id` metadata field equal to it; an empty query matches everything.
#[derive(Debug, Clone)]
pub struct LayeredMemoryBackend {
    manager: Arc<LayeredStoreManager>,
}

impl LayeredMemoryBackend {
    pub fn new(manager: Arc<LayeredStoreManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &LayeredStoreManager {
        &self.manager
    }

    fn to_recalled(layer: Layer, item: MemoryItem) -> RecalledRecord {
        let content = match item.content.get("content") {
            Some(Value::String(content)) => content.clone(),
            _ => Value::Object(item.content.clone()).to_string(),
        };
        RecalledRecord {
            content,
            key: Some(item.id),
            layer: Some(layer.to_string()),
            metadata: item.metadata,
        }
    }
}

fn metadata_matches(item: &MemoryItem, filters: &Map<String, Value>) -> bool {
    filters
        .iter()
        .filter(|(name, _)| name.as_str() != "key" && name.as_str() != "layer")
        .all(|(name, expected)| item.metadata.get(name) == Some(expected))
}

fn query_matches(item: &MemoryItem, query: &str) -> bool {
    query.is_empty()
        || item.id.contains(query)
        || item.metadata.get("task_id").and_then(Value::as_str) == Some(query)
}

impl MemoryBackend for LayeredMemoryBackend {
    fn save(
        &self,
        content: &str,
        layer: &str,
        metadata: &Map<String, Value>,
        key: &str,
    ) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("content".to_string(), Value::String(content.to_string()));
        payload.insert("layer".to_string(), Value::String(layer.to_string()));
        payload.insert("key".to_string(), Value::String(key.to_string()));

        let item = MemoryItem {
            id: key.to_string(),
            content: payload,
            metadata: metadata.clone(),
        };
        self.manager.save(layer, &item)?;
        debug!(key, layer, "memory record saved");
        Ok(())
    }

    fn recall(
        &self,
        query: &str,
        filters: &Map<String, Value>,
        limit: usize,
    ) -> Result<Vec<RecalledRecord>> {
        let layers = match filters.get("layer").and_then(Value::as_str) {
            Some(name) => vec![name.parse::<Layer>()?],
            None => Layer::ALL.to_vec(),
        };
        let exact_key = filters.get("key").and_then(Value::as_str);

        let mut records = Vec::new();
        for layer in layers {
            let layer_name = layer.as_str();
            let ids = match exact_key {
                Some(key) => vec![key.to_string()],
                None => self.manager.list(layer_name)?,
            };

            for id in ids {
                if records.len() >= limit {
                    return Ok(records);
                }
                let Some(item) = self.manager.load(layer_name, &id)? else {
                    continue;
                };
                if exact_key.is_none() && !query_matches(&item, query) {
                    continue;
                }
                if metadata_matches(&item, filters) {
                    records.push(Self::to_recalled(layer, item));
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use memory_store::LayeredConfig;
    use serde_json::json;
    use tempfile::tempdir;

    fn filters(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn backend(dir: &tempfile::TempDir) -> LayeredMemoryBackend {
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let manager = LayeredStoreManager::new(LayeredConfig::under(base)).unwrap();
        LayeredMemoryBackend::new(Arc::new(manager))
    }

    #[test]
    fn test_save_then_recall_by_key() {
        let dir = tempdir().unwrap();
        let backend = backend(&dir);

        backend
            .save("{\"a\":1}", "project", &filters(json!({"type": "note"})), "k1")
            .unwrap();

        let found = backend
            .recall("k1", &filters(json!({"key": "k1"})), 5)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "{\"a\":1}");
        assert_eq!(found[0].key.as_deref(), Some("k1"));
        assert_eq!(found[0].layer.as_deref(), Some("project"));
    }

    #[test]
    fn test_recall_by_task_metadata_and_type() {
        let dir = tempdir().unwrap();
        let backend = backend(&dir);

        let meta = |kind: &str| filters(json!({"task_id": "t-9", "type": kind}));
        backend.save("one", "project", &meta("note"), "alpha").unwrap();
        backend.save("two", "global", &meta("decision"), "beta").unwrap();
        backend
            .save("three", "session", &filters(json!({"task_id": "other"})), "gamma")
            .unwrap();

        assert_eq!(backend.recall("t-9", &Map::new(), 10).unwrap().len(), 2);

        let decisions = backend
            .recall("t-9", &filters(json!({"type": "decision"})), 10)
            .unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].key.as_deref(), Some("beta"));

        assert_eq!(backend.recall("", &Map::new(), 2).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_layer_filter_is_an_error() {
        let dir = tempdir().unwrap();
        let backend = backend(&dir);
        assert!(
            backend
                .recall("x", &filters(json!({"layer": "archive"})), 1)
                .is_err()
        );
    }
}
