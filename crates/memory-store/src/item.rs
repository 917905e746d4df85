//! Memory item schema - the unit stored in every layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::Record;

/// One stored record: an opaque id, a JSON payload and layer metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique identifier within a layer
    pub id: String,

    /// Payload
    #[serde(default)]
    pub content: Map<String, Value>,

    /// Layer-specific metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MemoryItem {
    /// Create a new memory item.
    pub fn new(id: impl Into<String>, content: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            content,
            metadata: Map::new(),
        }
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mapping persisted by the storage layer.
    pub fn to_record(&self) -> Record {
        let mut record = Map::new();
        record.insert("id".to_string(), Value::String(self.id.clone()));
        record.insert("content".to_string(), Value::Object(self.content.clone()));
        record.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
        record
    }

    /// Rebuild an item from a stored mapping.
    ///
    /// The stored `id` wins when present; `fallback_id` covers records written
    /// without one.
    pub fn from_record(fallback_id: &str, record: Record) -> Self {
        let mut record = record;
        let id = match record.remove("id") {
            Some(Value::String(id)) => id,
            _ => fallback_id.to_string(),
        };
        let content = match record.remove("content") {
            Some(Value::Object(content)) => content,
            _ => Map::new(),
        };
        let metadata = match record.remove("metadata") {
            Some(Value::Object(metadata)) => metadata,
            _ => Map::new(),
        };
        Self {
            id,
            content,
            metadata,
        }
    }
}
