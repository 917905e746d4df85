//! Task execution context snapshots.
//!
//! This crate provides:
//! - Context records (environment, files, commands) and their JSON form
//! - Capture / restore / switch over a pluggable memory backend
//! - Structural diffs between stored contexts

pub mod diff;
pub mod error;
pub mod host;
pub mod manager;
pub mod model;
pub mod recall;

pub use diff::{ContextDiff, diff_contexts};
pub use error::{ContextError, Result};
pub use host::{HostEnvironment, ProcessHost, ShellHistory, check_env_var};
pub use manager::{
    ContextManagerConfig, ContextSnapshotManager, RestoreReport, SwitchAction, SwitchReport,
};
pub use model::{
    CommandSnapshot, CursorPosition, EnvironmentSnapshot, FileSnapshot, TaskExecutionContext,
};
pub use recall::{LayeredMemoryBackend, MemoryBackend, RecalledRecord};
