//! Tracks which filesystem paths the session has observed through read-only
//! operations, and warns when a modifying command targets a path the model
//! has never looked at. The warning is advisory context, not a denial.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use super::command_risk::split_by_operators;

/// Commands that modify files on disk.
const FILE_MODIFYING_COMMANDS: &[&str] = &[
    "rm", "mv", "cp", "chmod", "chown", "dd", "ln", "touch", "mkdir", "shred",
];

/// Read-only commands whose path arguments count as "seen".
const READ_ONLY_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "less", "file", "stat", "wc", "du", "find", "tree", "grep",
    "rg", "diff", "readlink", "test",
];

/// A warning for a modifying command touching unobserved paths.
#[derive(Debug, Clone)]
pub struct UnseenPathWarning {
    pub unseen_paths: Vec<String>,
    pub message: String,
}

pub struct PathTracker {
    seen: RwLock<HashSet<PathBuf>>,
}

impl Default for PathTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTracker {
    pub fn new() -> Self {
        Self {
            seen: RwLock::new(HashSet::new()),
        }
    }

    /// Record a path (and its parent, so `ls dir` covers `rm dir/file`).
    pub async fn record_seen(&self, path: &Path) {
        let mut seen = self.seen.write().await;
        seen.insert(path.to_path_buf());
        if let Some(parent) = path.parent() {
            seen.insert(parent.to_path_buf());
        }
    }

    /// Parse a command line and record path arguments of read-only segments.
    pub async fn record_from_command(&self, workspace: &Path, command: &str) {
        for (segment, _) in split_by_operators(command) {
            let Ok(words) = shell_words::split(&segment) else {
                continue;
            };
            let Some((cmd, args)) = words.split_first() else {
                continue;
            };
            let base = cmd.rsplit('/').next().unwrap_or(cmd.as_str());
            if !READ_ONLY_COMMANDS.contains(&base) {
                continue;
            }
            for arg in path_arguments(args) {
                if let Ok(resolved) = super::fs_utils::resolve_in_workspace(workspace, &arg) {
                    self.record_seen(&resolved).await;
                }
            }
        }
    }

    /// Check a command about to run; returns a warning if any modifying
    /// segment targets paths this session has never observed.
    pub async fn check_modifying_command(
        &self,
        workspace: &Path,
        command: &str,
    ) -> Option<UnseenPathWarning> {
        let seen = self.seen.read().await;
        let mut unseen = Vec::new();

        for (segment, _) in split_by_operators(command) {
            let Ok(words) = shell_words::split(&segment) else {
                continue;
            };
            let Some((cmd, args)) = words.split_first() else {
                continue;
            };
            let base = cmd.rsplit('/').next().unwrap_or(cmd.as_str());
            if !FILE_MODIFYING_COMMANDS.contains(&base) {
                continue;
            }
            for arg in path_arguments(args) {
                let Ok(resolved) = super::fs_utils::resolve_in_workspace(workspace, &arg) else {
                    continue;
                };
                if !seen.contains(&resolved) && !ancestor_seen(&resolved, &seen) {
                    unseen.push(arg);
                }
            }
        }

        if unseen.is_empty() {
            return None;
        }
        let message = format!(
            "warning: modifying paths never observed this session: {}. \
             Inspect them first (read_file, search_files, ls) to confirm the target.",
            unseen.join(", ")
        );
        Some(UnseenPathWarning {
            unseen_paths: unseen,
            message,
        })
    }
}

fn ancestor_seen(path: &Path, seen: &HashSet<PathBuf>) -> bool {
    path.ancestors().skip(1).any(|a| seen.contains(a))
}

/// Positional arguments that look like paths: flags and shell variables are
/// skipped.
fn path_arguments(args: &[String]) -> Vec<String> {
    args.iter()
        .filter(|a| !a.starts_with('-') && !a.starts_with('$') && !a.contains('*'))
        .cloned()
        .collect()
}
