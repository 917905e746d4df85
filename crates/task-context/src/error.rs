use memory_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("No stored context for task {0}")]
    NotFound(String),

    #[error("Context serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Memory backend error: {0}")]
    Backend(String),
}
