//! Access to the live process: directory, environment, packages, shell history.

use anyhow::{Context, Result};
use memory_common::paths::{existing_history_files, home_dir, shell_from_path};
use memory_common::{find_program, run_command_with_timeout};
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Commands read from a shell history file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellHistory {
    pub commands: Vec<String>,
    pub shell: String,
}

/// The live environment a context is captured from and restored into.
pub trait HostEnvironment {
    fn current_dir(&self) -> io::Result<PathBuf>;

    fn set_current_dir(&self, path: &Path) -> io::Result<()>;

    fn var(&self, name: &str) -> Option<String>;

    /// Set a variable; names and values the platform cannot hold are rejected.
    fn set_var(&self, name: &str, value: &str) -> io::Result<()>;

    /// Interpreter found on PATH, if any.
    fn interpreter_path(&self) -> Option<String>;

    /// Installed package identifiers; empty on any failure or timeout.
    fn installed_packages(&self, command: &[String], timeout: Duration) -> Vec<String>;

    /// The last `limit` commands of the user's shell history.
    fn shell_history(&self, limit: usize) -> Option<ShellHistory>;
}

/// [`HostEnvironment`] backed by the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessHost;

impl HostEnvironment for ProcessHost {
    fn current_dir(&self) -> io::Result<PathBuf> {
        std::env::current_dir()
    }

    fn set_current_dir(&self, path: &Path) -> io::Result<()> {
        std::env::set_current_dir(path)
    }

    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn set_var(&self, name: &str, value: &str) -> io::Result<()> {
        check_env_var(name, value)?;
        // SAFETY: context restores are serialized by the owning manager
        // (`&mut self`) and no other thread may read the environment meanwhile.
        unsafe { std::env::set_var(name, value) }
        Ok(())
    }

    fn interpreter_path(&self) -> Option<String> {
        find_program(&["python3", "python"]).map(|path| path.display().to_string())
    }

    fn installed_packages(&self, command: &[String], timeout: Duration) -> Vec<String> {
        let Some((program, args)) = command.split_first() else {
            return Vec::new();
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        match run_command_with_timeout(program, &args, timeout) {
            Ok(result) if result.success => result
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Ok(result) => {
                debug!(program = %program, code = ?result.exit_code, "package listing failed");
                Vec::new()
            }
            Err(e) => {
                debug!(program = %program, error = %e, "package listing unavailable");
                Vec::new()
            }
        }
    }

    fn shell_history(&self, limit: usize) -> Option<ShellHistory> {
        let home = home_dir()?;
        let candidates = existing_history_files(&home);
        let preferred = self.var("SHELL").and_then(|shell| shell_from_path(&shell));

        let (path, shell) = candidates
            .iter()
            .find(|(_, shell)| Some(*shell) == preferred)
            .or_else(|| candidates.first())?;

        match read_history(path, shell, limit) {
            Ok(commands) => Some(ShellHistory {
                commands,
                shell: shell.to_string(),
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "shell history unreadable");
                None
            }
        }
    }
}

/// Reject a name that is empty or contains `=` or NUL, or a value containing NUL.
pub fn check_env_var(name: &str, value: &str) -> io::Result<()> {
    if name.is_empty() || name.contains(['=', '\0']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid environment variable name {:?}", name),
        ));
    }
    if value.contains('\0') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("value of {} contains a NUL byte", name),
        ));
    }
    Ok(())
}

fn read_history(path: &Path, shell: &str, limit: usize) -> Result<Vec<String>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read history file: {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);
    Ok(parse_history(&content, shell, limit))
}

/// Extract the last `limit` commands from history file content.
///
/// Understands zsh extended history (`: <epoch>:<elapsed>;<command>`), fish
/// (`- cmd: <command>`) and bash, where `#<epoch>` timestamp lines are skipped.
pub fn parse_history(content: &str, shell: &str, limit: usize) -> Vec<String> {
    let zsh_extended = Regex::new(r"^: \d+:\d+;(.*)$").ok();
    let fish_entry = Regex::new(r"^- cmd: (.*)$").ok();
    let bash_timestamp = Regex::new(r"^#\d+$").ok();

    let mut commands: Vec<String> = content
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            match shell {
                "zsh" => Some(
                    zsh_extended
                        .as_ref()
                        .and_then(|re| re.captures(line))
                        .and_then(|caps| caps.get(1))
                        .map_or(line, |m| m.as_str()),
                ),
                "fish" => fish_entry
                    .as_ref()
                    .and_then(|re| re.captures(line))
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str()),
                _ => {
                    let is_timestamp = bash_timestamp.as_ref().is_some_and(|re| re.is_match(line));
                    (!is_timestamp).then_some(line)
                }
            }
        })
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .map(str::to_string)
        .collect();

    if commands.len() > limit {
        commands.drain(..commands.len() - limit);
    }
    commands
}
