//! Subprocess execution utilities.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Output;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Poll interval while waiting on a bounded child process.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code (None if killed by signal)
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
}

impl CommandResult {
    /// Create from std::process::Output.
    pub fn from_output(output: &Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Run a program, killing it if it has not exited within `timeout`.
pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandResult> {
    let handle = duct::cmd(program, args.iter().copied())
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .start()
        .with_context(|| format!("Failed to spawn command: {}", program))?;

    let start = Instant::now();
    loop {
        match handle.try_wait() {
            Ok(Some(output)) => return Ok(CommandResult::from_output(output)),
            Ok(None) => {
                if start.elapsed() > timeout {
                    if let Err(e) = handle.kill() {
                        debug!(program, error = %e, "failed to kill timed out command");
                    }
                    anyhow::bail!("Command timed out after {:?}: {}", timeout, program);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e).context("Failed to wait for command"),
        }
    }
}

/// First of `candidates` found on PATH.
pub fn find_program(candidates: &[&str]) -> Option<PathBuf> {
    candidates.iter().find_map(|name| which::which(name).ok())
}
