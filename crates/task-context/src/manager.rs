//! Capture, restore, switch between and diff task execution contexts.
//!
//! Contexts are persisted through a [`MemoryBackend`] under
//! `task_context_<task_id>`, with reserved characters percent-escaped. The
//! latest capture for a task replaces the previous one.

use chrono::Utc;
use memory_common::paths::shell_from_path;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::diff::{ContextDiff, diff_contexts};
use crate::error::{ContextError, Result};
use crate::host::{HostEnvironment, ProcessHost};
use crate::model::{
    CommandSnapshot, DEFAULT_SHELL, EnvironmentSnapshot, FileSnapshot, MAX_RECENT_COMMANDS,
    TaskExecutionContext, hash_file,
};
use crate::recall::MemoryBackend;

/// Metadata `type` tag for persisted contexts.
pub const CONTEXT_RECORD_TYPE: &str = "task_context";

/// Environment variables captured into every snapshot.
pub const DEFAULT_ENV_ALLOW_LIST: &[&str] = &[
    "PWD",
    "PYTHONPATH",
    "VIRTUAL_ENV",
    "CONDA_DEFAULT_ENV",
    "NODE_PATH",
    "GOPATH",
    "CARGO_HOME",
];

/// Project marker files hashed on every capture when present.
pub const DEFAULT_MARKER_FILES: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "pyproject.toml",
    "requirements.txt",
    "setup.py",
    "go.mod",
    "Makefile",
    "README.md",
    ".gitignore",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextManagerConfig {
    /// Storage layer contexts are saved to
    pub layer: String,
    /// Program and arguments listing installed packages
    pub package_command: Vec<String>,
    pub package_timeout_ms: u64,
    pub history_limit: usize,
    pub marker_files: Vec<String>,
    pub env_allow_list: Vec<String>,
    /// Maximum related memory keys recorded per capture
    pub related_memory_limit: usize,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            layer: "project".to_string(),
            package_command: ["pip", "list", "--format=freeze"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            package_timeout_ms: 2_000,
            history_limit: MAX_RECENT_COMMANDS,
            marker_files: DEFAULT_MARKER_FILES.iter().map(|s| s.to_string()).collect(),
            env_allow_list: DEFAULT_ENV_ALLOW_LIST.iter().map(|s| s.to_string()).collect(),
            related_memory_limit: 20,
        }
    }
}

impl ContextManagerConfig {
    pub fn package_timeout(&self) -> Duration {
        Duration::from_millis(self.package_timeout_ms)
    }
}

/// Outcome of [`ContextSnapshotManager::restore`]. Drift is reported, not corrected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub task_id: String,
    pub restored: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub files_changed: Vec<String>,
    pub files_missing: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchAction {
    /// A stored context was restored
    Restored,
    /// No stored context existed; a new one was captured
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchReport {
    pub action: SwitchAction,
    pub task_id: String,
    /// Context that was active before the switch
    pub previous: Option<String>,
    pub restore: Option<RestoreReport>,
}

/// Tracks the active context and moves between contexts.
///
/// Not shareable across threads while mutating: every state-changing call
/// takes `&mut self`.
pub struct ContextSnapshotManager {
    backend: Arc<dyn MemoryBackend>,
    host: Box<dyn HostEnvironment>,
    config: ContextManagerConfig,
    active_context: Option<TaskExecutionContext>,
    context_stack: Vec<String>,
    modified_files: BTreeSet<String>,
    thinking_patterns: BTreeSet<String>,
    notes: String,
}

impl ContextSnapshotManager {
    /// Manager over the live process.
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self::with_host(backend, Box::new(ProcessHost), ContextManagerConfig::default())
    }

    pub fn with_host(
        backend: Arc<dyn MemoryBackend>,
        host: Box<dyn HostEnvironment>,
        config: ContextManagerConfig,
    ) -> Self {
        Self {
            backend,
            host,
            config,
            active_context: None,
            context_stack: Vec::new(),
            modified_files: BTreeSet::new(),
            thinking_patterns: BTreeSet::new(),
            notes: String::new(),
        }
    }

    pub fn active_context(&self) -> Option<&TaskExecutionContext> {
        self.active_context.as_ref()
    }

    /// Ids of previously active contexts, oldest first.
    pub fn context_stack(&self) -> &[String] {
        &self.context_stack
    }

    pub fn modified_files(&self) -> &BTreeSet<String> {
        &self.modified_files
    }

    /// Record `path` for inclusion in the next capture.
    ///
    /// Ignored (returns `false`) when no context is active.
    pub fn track_file_modification(&mut self, path: impl Into<String>) -> bool {
        let path = path.into();
        if self.active_context.is_none() {
            debug!(path = %path, "no active context, modification not tracked");
            return false;
        }
        self.modified_files.insert(path)
    }

    /// Stage a thinking-pattern label for the next capture.
    pub fn record_thinking_pattern(&mut self, label: impl Into<String>) {
        self.thinking_patterns.insert(label.into());
    }

    /// Append a line of free text to the notes of the next capture.
    pub fn add_note(&mut self, note: &str) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(note);
    }

    /// Snapshot the live state for `task_id` and persist it.
    ///
    /// Does not change the active context.
    pub fn capture(&self, task_id: &str, branch_id: Option<&str>) -> Result<TaskExecutionContext> {
        let environment = self.capture_environment();
        let working_directory = PathBuf::from(&environment.working_directory);

        let context = TaskExecutionContext {
            task_id: task_id.to_string(),
            branch_id: branch_id.map(str::to_string),
            files: self.capture_files(&working_directory),
            environment,
            commands: self.capture_commands(),
            thinking_patterns: self.thinking_patterns.clone(),
            memory_keys: self.related_memory_keys(task_id),
            notes: self.notes.clone(),
            captured_at: Utc::now(),
        };

        self.persist(&context)?;
        info!(
            task_id,
            files = context.files.len(),
            commands = context.commands.recent_commands.len(),
            "context captured"
        );
        Ok(context)
    }

    /// Apply `context` to the live environment and make it active.
    pub fn restore(&mut self, context: TaskExecutionContext) -> RestoreReport {
        let mut report = RestoreReport {
            task_id: context.task_id.clone(),
            ..RestoreReport::default()
        };
        let environment = &context.environment;
        let working_directory = Path::new(&environment.working_directory);

        if working_directory.is_dir() {
            match self.host.set_current_dir(working_directory) {
                Ok(()) => report
                    .restored
                    .push(format!("working directory: {}", working_directory.display())),
                Err(e) => report.warnings.push(format!(
                    "could not enter {}: {}",
                    working_directory.display(),
                    e
                )),
            }
        } else {
            report.warnings.push(format!(
                "working directory no longer exists: {}",
                working_directory.display()
            ));
        }

        let mut applied = 0;
        for (name, value) in &environment.env_vars {
            match self.host.set_var(name, value) {
                Ok(()) => applied += 1,
                Err(e) => report
                    .warnings
                    .push(format!("environment variable {:?} not restored: {}", name, e)),
            }
        }
        if applied > 0 {
            report.restored.push(format!("{} environment variables", applied));
        }

        if let Some(venv) = &environment.virtual_env {
            if Path::new(venv).is_dir() {
                report.restored.push(format!("virtual environment: {}", venv));
            } else {
                report
                    .warnings
                    .push(format!("virtual environment not found: {}", venv));
            }
        }

        for file in &context.files {
            let resolved = resolve(working_directory, &file.path);
            if !resolved.exists() {
                report.files_missing.push(file.path.clone());
                continue;
            }
            match hash_file(&resolved) {
                Ok(hash) if hash != file.content_hash => {
                    report.files_changed.push(file.path.clone())
                }
                Ok(_) => {}
                Err(e) => report
                    .errors
                    .push(format!("could not hash {}: {}", file.path, e)),
            }
        }
        if !report.files_changed.is_empty() {
            report.warnings.push(format!(
                "{} files changed since capture",
                report.files_changed.len()
            ));
        }
        if !report.files_missing.is_empty() {
            report.warnings.push(format!(
                "{} files missing since capture",
                report.files_missing.len()
            ));
        }

        self.modified_files = context
            .files
            .iter()
            .filter(|f| !self.config.marker_files.contains(&f.path))
            .map(|f| f.path.clone())
            .collect();
        self.thinking_patterns = context.thinking_patterns.clone();
        self.notes = context.notes.clone();

        info!(
            task_id = %context.task_id,
            warnings = report.warnings.len(),
            "context restored"
        );
        self.active_context = Some(context);
        report
    }

    /// Make `new_task_id` the active context.
    ///
    /// The current context (if any) is captured and its id pushed onto the
    /// stack. A stored context for `new_task_id` is restored; otherwise a new
    /// one is captured.
    pub fn switch(&mut self, new_task_id: &str, branch_id: Option<&str>) -> Result<SwitchReport> {
        let previous = self.flush_active()?;
        if let Some(id) = &previous {
            self.context_stack.push(id.clone());
        }
        self.activate(new_task_id, branch_id, previous)
    }

    /// Return to the most recently stacked context.
    ///
    /// The current context is captured but not stacked. `None` when the stack
    /// is empty.
    pub fn pop_context(&mut self) -> Result<Option<SwitchReport>> {
        let Some(task_id) = self.context_stack.pop() else {
            return Ok(None);
        };
        let previous = self.flush_active()?;
        self.activate(&task_id, None, previous).map(Some)
    }

    /// Stored context for `task_id`, if any.
    ///
    /// A stored record that cannot be parsed is treated as absent.
    pub fn load_context(&self, task_id: &str) -> Result<Option<TaskExecutionContext>> {
        let key = TaskExecutionContext::storage_key(task_id);
        let mut filters = Map::new();
        filters.insert("key".to_string(), Value::String(key.clone()));
        filters.insert("layer".to_string(), Value::String(self.config.layer.clone()));

        let Some(record) = self.backend.recall(&key, &filters, 1)?.into_iter().next() else {
            return Ok(None);
        };
        match TaskExecutionContext::from_json(&record.content) {
            Ok(context) => Ok(Some(context)),
            Err(e) => {
                warn!(task_id, error = %e, "stored context is malformed, ignoring");
                Ok(None)
            }
        }
    }

    /// Structural diff between the stored contexts of two tasks.
    pub fn diff(&self, id_a: &str, id_b: &str) -> Result<ContextDiff> {
        let a = self
            .load_context(id_a)?
            .ok_or_else(|| ContextError::NotFound(id_a.to_string()))?;
        let b = self
            .load_context(id_b)?
            .ok_or_else(|| ContextError::NotFound(id_b.to_string()))?;
        Ok(diff_contexts(&a, &b))
    }

    /// Capture the active context, if any, returning its id.
    fn flush_active(&mut self) -> Result<Option<String>> {
        let Some(active) = &self.active_context else {
            return Ok(None);
        };
        let task_id = active.task_id.clone();
        let branch_id = active.branch_id.clone();
        self.capture(&task_id, branch_id.as_deref())?;
        Ok(Some(task_id))
    }

    fn activate(
        &mut self,
        task_id: &str,
        branch_id: Option<&str>,
        previous: Option<String>,
    ) -> Result<SwitchReport> {
        self.modified_files.clear();
        self.thinking_patterns.clear();
        self.notes.clear();

        match self.load_context(task_id)? {
            Some(context) => {
                let restore = self.restore(context);
                info!(task_id, previous = ?previous, "switched to stored context");
                Ok(SwitchReport {
                    action: SwitchAction::Restored,
                    task_id: task_id.to_string(),
                    previous,
                    restore: Some(restore),
                })
            }
            None => {
                let context = self.capture(task_id, branch_id)?;
                self.active_context = Some(context);
                info!(task_id, previous = ?previous, "switched to new context");
                Ok(SwitchReport {
                    action: SwitchAction::Created,
                    task_id: task_id.to_string(),
                    previous,
                    restore: None,
                })
            }
        }
    }

    fn persist(&self, context: &TaskExecutionContext) -> Result<()> {
        let mut metadata = Map::new();
        metadata.insert("type".to_string(), Value::String(CONTEXT_RECORD_TYPE.to_string()));
        metadata.insert("task_id".to_string(), Value::String(context.task_id.clone()));
        metadata.insert(
            "branch_id".to_string(),
            context
                .branch_id
                .clone()
                .map_or(Value::Null, Value::String),
        );
        metadata.insert(
            "captured_at".to_string(),
            Value::String(context.captured_at.to_rfc3339()),
        );

        self.backend.save(
            &context.to_json()?,
            &self.config.layer,
            &metadata,
            &TaskExecutionContext::storage_key(&context.task_id),
        )
    }

    fn capture_environment(&self) -> EnvironmentSnapshot {
        let working_directory = self
            .host
            .current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|_| ".".to_string());

        let env_vars = self
            .config
            .env_allow_list
            .iter()
            .filter_map(|name| self.host.var(name).map(|value| (name.clone(), value)))
            .collect();

        EnvironmentSnapshot {
            working_directory,
            python_path: self.host.interpreter_path(),
            virtual_env: self.host.var("VIRTUAL_ENV"),
            env_vars,
            installed_packages: self
                .host
                .installed_packages(&self.config.package_command, self.config.package_timeout()),
        }
    }

    /// Tracked paths first, then marker files present in `working_directory`.
    fn capture_files(&self, working_directory: &Path) -> Vec<FileSnapshot> {
        let mut seen = BTreeSet::new();
        let mut files = Vec::new();

        let tracked = self.modified_files.iter();
        let markers = self
            .config
            .marker_files
            .iter()
            .filter(|marker| working_directory.join(marker).is_file());

        for path in tracked.chain(markers) {
            if !seen.insert(path.as_str()) {
                continue;
            }
            let resolved = resolve(working_directory, path);
            match FileSnapshot::capture(path.as_str(), &resolved) {
                Ok(snapshot) => files.push(snapshot),
                Err(e) => debug!(path = %path, error = %e, "file skipped during capture"),
            }
        }
        files
    }

    fn capture_commands(&self) -> CommandSnapshot {
        match self.host.shell_history(self.config.history_limit) {
            Some(history) => CommandSnapshot::new(history.commands, history.shell),
            None => {
                let shell = self
                    .host
                    .var("SHELL")
                    .and_then(|shell| shell_from_path(&shell))
                    .unwrap_or(DEFAULT_SHELL);
                CommandSnapshot::new(Vec::new(), shell)
            }
        }
    }

    /// Keys of memory records tagged with `task_id`, other than stored contexts.
    fn related_memory_keys(&self, task_id: &str) -> BTreeSet<String> {
        let mut filters = Map::new();
        filters.insert("task_id".to_string(), Value::String(task_id.to_string()));

        // One extra slot for the task's own context record.
        match self
            .backend
            .recall(task_id, &filters, self.config.related_memory_limit + 1)
        {
            Ok(records) => records
                .into_iter()
                .filter(|record| {
                    record.metadata.get("type").and_then(Value::as_str)
                        != Some(CONTEXT_RECORD_TYPE)
                })
                .filter_map(|record| record.key)
                .take(self.config.related_memory_limit)
                .collect(),
            Err(e) => {
                warn!(task_id, error = %e, "related memory lookup failed");
                BTreeSet::new()
            }
        }
    }
}

fn resolve(working_directory: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_directory.join(path)
    }
}
