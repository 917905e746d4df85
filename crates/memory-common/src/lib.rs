//! Common utilities for the layered memory store and task contexts.
//!
//! This crate provides shared functionality:
//! - Bounded subprocess execution
//! - Store and shell history path resolution

pub mod paths;
pub mod subprocess;

pub use paths::default_store_base;
pub use subprocess::{CommandResult, find_program, run_command_with_timeout};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::paths::{default_store_base, home_dir};
    pub use crate::subprocess::{CommandResult, find_program, run_command_with_timeout};
    pub use anyhow::{Context, Result};
}
