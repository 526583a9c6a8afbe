//! Filesystem helpers shared by the built-in tools and the sandbox.

use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncReadExt;

/// Directories skipped during recursive walks (search, sandbox copy).
pub const DEFAULT_IGNORE_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    "dist",
    "build",
    ".next",
    ".cache",
    "coverage",
    ".idea",
];

/// Path patterns that should never be written to, independent of the
/// confirmation step.
pub const SENSITIVE_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".env",
    ".key",
    ".pem",
    ".aws/credentials",
    ".netrc",
    ".docker/config.json",
    "id_rsa",
    "id_ed25519",
];

/// Resolve a model-supplied path inside the workspace root.
///
/// Relative paths are joined to the root; absolute paths must already lie
/// under it. `..` components are resolved lexically and may not escape the
/// root. This confinement is what makes the sandbox copy equivalent to the
/// real workspace from a tool's point of view.
pub fn resolve_in_workspace(root: &Path, path: &str) -> anyhow::Result<PathBuf> {
    let expanded = shellexpand::tilde(path).to_string();
    let candidate = PathBuf::from(&expanded);

    let joined = if candidate.is_absolute() {
        candidate
    } else {
        root.join(&candidate)
    };

    // Lexical normalization: no filesystem access, so unborn files resolve too.
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    anyhow::bail!("path escapes the workspace root: {path}");
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    if !normalized.starts_with(root) {
        anyhow::bail!("path is outside the workspace root: {path}");
    }
    Ok(normalized)
}

/// Returns true if the path matches any sensitive pattern.
pub fn is_sensitive_path(path: &Path) -> bool {
    let s = path.to_string_lossy();
    SENSITIVE_PATTERNS.iter().any(|p| s.contains(p))
}

pub fn is_ignored_dir(name: &str, extra: &[String]) -> bool {
    DEFAULT_IGNORE_DIRS.contains(&name) || extra.iter().any(|e| e == name)
}

/// Sniff the first bytes for NUL to detect binary content.
pub async fn is_binary_file(path: &Path) -> anyhow::Result<bool> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = [0u8; 1024];
    let n = file.read(&mut buf).await?;
    Ok(buf[..n].contains(&0))
}

/// Prefix each line with its 1-based number, `start` being the offset of the
/// first line.
pub fn format_with_line_numbers(content: &str, start: usize) -> String {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:>5} | {}", start + i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}
