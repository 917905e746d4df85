//! Execution context records and their mapping form.
//!
//! Every record serializes to a JSON object and deserializes back with
//! defaults for absent optional fields:
//! - `working_directory` defaults to the process's current directory
//! - `shell` defaults to `bash`
//! - `captured_at` / `last_modified` default to now
//! - collections default to empty

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::error::Result;

/// Commands retained in a [`CommandSnapshot`].
pub const MAX_RECENT_COMMANDS: usize = 50;

/// Shell flavor assumed when none is recorded.
pub const DEFAULT_SHELL: &str = "bash";

/// Prefix of the storage key derived from a task id.
pub const CONTEXT_KEY_PREFIX: &str = "task_context_";

/// Streaming SHA-256 of a file's full contents, hex encoded.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn default_working_directory() -> String {
    std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|_| ".".to_string())
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

/// Cursor location inside an open editor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// State of one file at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// Path as tracked (relative paths resolve against the working directory)
    pub path: String,

    /// SHA-256 over the full file contents
    pub content_hash: String,

    #[serde(default = "Utc::now")]
    pub last_modified: DateTime<Utc>,

    #[serde(default)]
    pub cursor_position: Option<CursorPosition>,

    #[serde(default)]
    pub is_open: bool,

    #[serde(default)]
    pub unsaved_changes: Option<String>,
}

impl FileSnapshot {
    /// Hash and stat `resolved`, recording it under `path`.
    pub fn capture(path: impl Into<String>, resolved: &Path) -> io::Result<Self> {
        let content_hash = hash_file(resolved)?;
        let last_modified = std::fs::metadata(resolved)?
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Self {
            path: path.into(),
            content_hash,
            last_modified,
            cursor_position: None,
            is_open: false,
            unsaved_changes: None,
        })
    }
}

/// Process environment at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    #[serde(default = "default_working_directory")]
    pub working_directory: String,

    /// Interpreter on PATH
    #[serde(default)]
    pub python_path: Option<String>,

    #[serde(default)]
    pub virtual_env: Option<String>,

    /// Allow-listed environment variables
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    #[serde(default)]
    pub installed_packages: Vec<String>,
}

impl Default for EnvironmentSnapshot {
    fn default() -> Self {
        Self {
            working_directory: default_working_directory(),
            python_path: None,
            virtual_env: None,
            env_vars: BTreeMap::new(),
            installed_packages: Vec::new(),
        }
    }
}

/// Recent shell activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSnapshot {
    /// Oldest first, at most [`MAX_RECENT_COMMANDS`]
    #[serde(default)]
    pub recent_commands: Vec<String>,

    #[serde(default)]
    pub last_exit_code: i32,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl CommandSnapshot {
    /// Snapshot keeping only the most recent [`MAX_RECENT_COMMANDS`] commands.
    pub fn new(commands: Vec<String>, shell: impl Into<String>) -> Self {
        let mut recent_commands = commands;
        if recent_commands.len() > MAX_RECENT_COMMANDS {
            recent_commands.drain(..recent_commands.len() - MAX_RECENT_COMMANDS);
        }
        Self {
            recent_commands,
            last_exit_code: 0,
            shell: shell.into(),
            aliases: BTreeMap::new(),
        }
    }
}

impl Default for CommandSnapshot {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_SHELL)
    }
}

/// Everything needed to pause and resume one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionContext {
    pub task_id: String,

    /// Free-form lineage tag
    #[serde(default)]
    pub branch_id: Option<String>,

    #[serde(default)]
    pub environment: EnvironmentSnapshot,

    /// In capture order
    #[serde(default)]
    pub files: Vec<FileSnapshot>,

    #[serde(default)]
    pub commands: CommandSnapshot,

    #[serde(default)]
    pub thinking_patterns: BTreeSet<String>,

    /// Keys of related external memory records
    #[serde(default)]
    pub memory_keys: BTreeSet<String>,

    #[serde(default)]
    pub notes: String,

    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
}

impl TaskExecutionContext {
    /// Empty context for `task_id`, captured now.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            branch_id: None,
            environment: EnvironmentSnapshot::default(),
            files: Vec::new(),
            commands: CommandSnapshot::default(),
            thinking_patterns: BTreeSet::new(),
            memory_keys: BTreeSet::new(),
            notes: String::new(),
            captured_at: Utc::now(),
        }
    }

    /// Deterministic storage key for a task's context.
    ///
    /// Characters a store id may not carry (`/`, `\`, `.`, NUL) and `%` itself
    /// are percent-escaped, so distinct task ids always give distinct, valid keys.
    pub fn storage_key(task_id: &str) -> String {
        let mut key = String::with_capacity(CONTEXT_KEY_PREFIX.len() + task_id.len());
        key.push_str(CONTEXT_KEY_PREFIX);
        for c in task_id.chars() {
            match c {
                '%' | '/' | '\\' | '.' | '\0' => key.push_str(&format!("%{:02X}", c as u32)),
                _ => key.push(c),
            }
        }
        key
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Latest snapshot recorded for `path`.
    pub fn file(&self, path: &str) -> Option<&FileSnapshot> {
        self.files.iter().rev().find(|file| file.path == path)
    }
}
