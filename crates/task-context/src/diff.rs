//! Structural comparison of two task contexts.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::model::TaskExecutionContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueChange {
    pub from: String,
    pub to: String,
}

/// File differences keyed by path, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandChanges {
    pub new_commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextDiff {
    pub from_task: String,
    pub to_task: String,
    pub working_directory: Option<ValueChange>,
    pub files: FileChanges,
    pub commands: CommandChanges,
}

impl ContextDiff {
    pub fn is_empty(&self) -> bool {
        self.working_directory.is_none()
            && self.files.added.is_empty()
            && self.files.removed.is_empty()
            && self.files.modified.is_empty()
            && self.commands.new_commands.is_empty()
    }
}

impl fmt::Display for ContextDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} -> {}", self.from_task, self.to_task)?;
        if let Some(change) = &self.working_directory {
            writeln!(f, "cwd: {} -> {}", change.from, change.to)?;
        }
        for path in &self.files.added {
            writeln!(f, "+ {}", path)?;
        }
        for path in &self.files.removed {
            writeln!(f, "- {}", path)?;
        }
        for path in &self.files.modified {
            writeln!(f, "~ {}", path)?;
        }
        for command in &self.commands.new_commands {
            writeln!(f, "$ {}", command)?;
        }
        Ok(())
    }
}

/// Compare `a` (before) with `b` (after).
///
/// Files are compared as sets keyed by path; a path recorded twice counts with
/// its last hash. New commands are reported only when `b`'s history extends
/// `a`'s; diverged histories yield none.
pub fn diff_contexts(a: &TaskExecutionContext, b: &TaskExecutionContext) -> ContextDiff {
    let working_directory = (a.environment.working_directory != b.environment.working_directory)
        .then(|| ValueChange {
            from: a.environment.working_directory.clone(),
            to: b.environment.working_directory.clone(),
        });

    ContextDiff {
        from_task: a.task_id.clone(),
        to_task: b.task_id.clone(),
        working_directory,
        files: diff_files(a, b),
        commands: diff_commands(&a.commands.recent_commands, &b.commands.recent_commands),
    }
}

fn file_hashes(context: &TaskExecutionContext) -> BTreeMap<&str, &str> {
    context
        .files
        .iter()
        .map(|file| (file.path.as_str(), file.content_hash.as_str()))
        .collect()
}

fn diff_files(a: &TaskExecutionContext, b: &TaskExecutionContext) -> FileChanges {
    let before = file_hashes(a);
    let after = file_hashes(b);
    let mut changes = FileChanges::default();

    for (path, hash) in &after {
        match before.get(path) {
            None => changes.added.push(path.to_string()),
            Some(old) if old != hash => changes.modified.push(path.to_string()),
            Some(_) => {}
        }
    }
    changes.removed = before
        .keys()
        .filter(|path| !after.contains_key(*path))
        .map(|path| path.to_string())
        .collect();

    changes
}

fn diff_commands(before: &[String], after: &[String]) -> CommandChanges {
    let new_commands = if after.len() > before.len() && after.starts_with(before) {
        after[before.len()..].to_vec()
    } else {
        Vec::new()
    };
    CommandChanges { new_commands }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommandSnapshot, FileSnapshot};
    use chrono::Utc;

    fn context(task_id: &str, files: &[(&str, &str)], commands: &[&str]) -> TaskExecutionContext {
        let mut context = TaskExecutionContext::new(task_id);
        context.environment.working_directory = "/work".to_string();
        context.files = files
            .iter()
            .map(|(path, hash)| FileSnapshot {
                path: path.to_string(),
                content_hash: hash.to_string(),
                last_modified: Utc::now(),
                cursor_position: None,
                is_open: false,
                unsaved_changes: None,
            })
            .collect();
        context.commands =
            CommandSnapshot::new(commands.iter().map(|c| c.to_string()).collect(), "bash");
        context
    }

    #[test]
    fn test_file_changes() {
        let a = context("a", &[("a.py", "hash1")], &[]);
        let b = context("b", &[("a.py", "hash2"), ("b.py", "hash3")], &[]);

        let diff = diff_contexts(&a, &b);
        assert_eq!(diff.files.added, vec!["b.py"]);
        assert_eq!(diff.files.modified, vec!["a.py"]);
        assert!(diff.files.removed.is_empty());
    }

    #[test]
    fn test_removed_and_unchanged_files() {
        let a = context("a", &[("keep.rs", "h"), ("gone.rs", "g")], &[]);
        let b = context("b", &[("keep.rs", "h")], &[]);

        let diff = diff_contexts(&a, &b);
        assert_eq!(diff.files.removed, vec!["gone.rs"]);
        assert!(diff.files.modified.is_empty());
        assert!(diff.files.added.is_empty());
    }

    #[test]
    fn test_duplicate_paths_use_last_hash() {
        let a = context("a", &[("x", "old"), ("x", "new")], &[]);
        let b = context("b", &[("x", "new")], &[]);
        assert!(diff_contexts(&a, &b).is_empty());
    }

    #[test]
    fn test_extended_history() {
        let a = context("a", &[], &["ls", "cd x"]);
        let b = context("b", &[], &["ls", "cd x", "pytest"]);
        assert_eq!(diff_contexts(&a, &b).commands.new_commands, vec!["pytest"]);
    }

    /// Known limitation: histories that diverge are not diffed at all.
    #[test]
    fn test_diverged_history_reports_no_new_commands() {
        let a = context("a", &[], &["ls", "cd x"]);
        let b = context("b", &[], &["ls", "cd y", "pytest"]);
        assert!(diff_contexts(&a, &b).commands.new_commands.is_empty());

        let shorter = context("c", &[], &["ls"]);
        assert!(diff_contexts(&a, &shorter).commands.new_commands.is_empty());
    }

    #[test]
    fn test_working_directory_change() {
        let a = context("a", &[], &[]);
        let mut b = context("b", &[], &[]);
        b.environment.working_directory = "/elsewhere".to_string();

        let diff = diff_contexts(&a, &b);
        assert_eq!(
            diff.working_directory,
            Some(ValueChange {
                from: "/work".to_string(),
                to: "/elsewhere".to_string(),
            })
        );
    }

    #[test]
    fn test_display_summary() {
        let mut a = context("before", &[("a.py", "1"), ("old.py", "2")], &["ls"]);
        a.environment.working_directory = "/w1".to_string();
        let mut b = context("after", &[("a.py", "9"), ("b.py", "3")], &["ls", "make"]);
        b.environment.working_directory = "/w2".to_string();

        let summary = diff_contexts(&a, &b).to_string();
        insta::assert_snapshot!(summary.trim_end(), @r"
        before -> after
        cwd: /w1 -> /w2
        + b.py
        - old.py
        ~ a.py
        $ make
        ");
    }
}
