//! Layered, crash-safe key/value storage for memory items.
//!
//! Provides:
//! - The `StorageBackend` contract
//! - A file-backed store with atomic writes, gzip, TTL caching and rotating backups
//! - A manager composing the global, project and session layers

pub mod backend;
mod cache;
pub mod config;
pub mod error;
pub mod item;
pub mod layered;
pub mod storage;

pub use backend::{Record, StorageBackend, StorageStats};
pub use config::{LayeredConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use item::MemoryItem;
pub use layered::{Layer, LayeredBatch, LayeredStats, LayeredStoreManager};
pub use storage::{BackupInfo, BatchScope, FileStore};
