//! Error types for the storage engine.

use camino::Utf8PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record {id}: {source}")]
    Serialization {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid item id: {0:?}")]
    InvalidId(String),

    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    #[error("Backups are disabled for {0}")]
    BackupsDisabled(Utf8PathBuf),

    #[error("No backup slot {slot} for item {id}")]
    MissingBackup { id: String, slot: usize },

    #[error("Failed to write item {id} to layer {layer}")]
    WriteFailed { layer: String, id: String },

    #[error("Failed to delete item {id} from layer {layer}")]
    DeleteFailed { layer: String, id: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
