//! Well-known locations for memory data and shell history.

use camino::Utf8PathBuf;
use std::path::PathBuf;

/// Environment variable that overrides the layered store base directory.
pub const STORE_PATH_ENV: &str = "AI_MEMORY_STORE_PATH";

/// Shell history files probed during context capture, with the shell they belong to.
pub const HISTORY_FILES: &[(&str, &str)] = &[
    (".zsh_history", "zsh"),
    (".bash_history", "bash"),
    (".local/share/fish/fish_history", "fish"),
];

/// Get home directory.
pub fn home_dir() -> Option<PathBuf> {
    dirs::home_dir()
}

/// Get default base directory for the layered store.
///
/// Priority:
/// 1. AI_MEMORY_STORE_PATH environment variable (if set)
/// 2. ~/.config/ai/memory/layers
/// 3. .config/ai/memory/layers relative to the working directory
pub fn default_store_base() -> Utf8PathBuf {
    if let Ok(custom_path) = std::env::var(STORE_PATH_ENV) {
        return Utf8PathBuf::from(custom_path);
    }

    home_dir()
        .and_then(|home| Utf8PathBuf::from_path_buf(home).ok())
        .map(|home| home.join(".config/ai/memory/layers"))
        .unwrap_or_else(|| Utf8PathBuf::from(".config/ai/memory/layers"))
}

/// History files that exist under `home`, in probe order.
pub fn existing_history_files(home: &std::path::Path) -> Vec<(PathBuf, &'static str)> {
    HISTORY_FILES
        .iter()
        .map(|(relative, shell)| (home.join(relative), *shell))
        .filter(|(path, _)| path.is_file())
        .collect()
}

/// Infer a shell flavor from a `$SHELL`-style path.
pub fn shell_from_path(shell: &str) -> Option<&'static str> {
    let name = shell.rsplit('/').next().unwrap_or(shell);
    HISTORY_FILES
        .iter()
        .map(|(_, flavor)| *flavor)
        .find(|flavor| *flavor == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_existing_history_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".bash_history"), "ls\n").unwrap();

        let found = existing_history_files(dir.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, "bash");
    }

    #[test]
    fn test_shell_from_path() {
        assert_eq!(shell_from_path("/bin/zsh"), Some("zsh"));
        assert_eq!(shell_from_path("/usr/local/bin/fish"), Some("fish"));
        assert_eq!(shell_from_path("bash"), Some("bash"));
        assert_eq!(shell_from_path("/bin/tcsh"), None);
    }
}
