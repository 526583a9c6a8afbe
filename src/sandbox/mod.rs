//! Isolated workspace copy for critical-risk runs.
//!
//! The whole executor run happens against a private filesystem copy. On
//! verified success, only the files the sandboxed run actually touched are
//! path-mapped back into the real workspace; any failure discards the copy
//! and leaves the real workspace byte-for-byte untouched. There is no shared
//! mutable state between copy and workspace until the explicit merge step.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::tools::fs_utils;

/// Files changed inside the sandbox relative to its creation baseline.
#[derive(Debug, Clone, Default)]
pub struct TouchedFiles {
    /// Created or modified, workspace-relative.
    pub changed: Vec<PathBuf>,
    /// Present at creation, missing now.
    pub deleted: Vec<PathBuf>,
}

impl TouchedFiles {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }

    pub fn count(&self) -> usize {
        self.changed.len() + self.deleted.len()
    }
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub merged: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

pub struct Sandbox {
    real_root: PathBuf,
    copy_root: PathBuf,
    /// Relative path -> content hash at creation time.
    baseline: HashMap<PathBuf, String>,
    extra_ignore: Vec<String>,
}

impl Sandbox {
    /// Copy the workspace into a private directory and record the baseline.
    pub async fn create(real_root: &Path, extra_ignore: Vec<String>) -> anyhow::Result<Self> {
        let real_root = real_root.to_path_buf();
        if !real_root.is_dir() {
            anyhow::bail!("workspace root is not a directory: {}", real_root.display());
        }
        let copy_root =
            std::env::temp_dir().join(format!("sandbox-{}", uuid::Uuid::new_v4().simple()));

        let (baseline, copied) = {
            let real_root = real_root.clone();
            let copy_root = copy_root.clone();
            let extra = extra_ignore.clone();
            tokio::task::spawn_blocking(move || copy_tree(&real_root, &copy_root, &extra)).await??
        };
        info!(
            copy_root = %copy_root.display(),
            files = copied,
            "sandbox created"
        );

        Ok(Self {
            real_root,
            copy_root,
            baseline,
            extra_ignore,
        })
    }

    /// Root of the copy — tools operate here during a sandboxed run.
    pub fn root(&self) -> &Path {
        &self.copy_root
    }

    /// Diff the copy against the creation baseline.
    pub async fn touched_files(&self) -> anyhow::Result<TouchedFiles> {
        let copy_root = self.copy_root.clone();
        let baseline = self.baseline.clone();
        let extra = self.extra_ignore.clone();
        tokio::task::spawn_blocking(move || {
            let mut touched = TouchedFiles::default();
            let mut seen: HashMap<PathBuf, String> = HashMap::new();
            for entry in walk_files(&copy_root, &extra) {
                let rel = entry
                    .strip_prefix(&copy_root)
                    .unwrap_or(&entry)
                    .to_path_buf();
                let hash = hash_file(&entry)?;
                seen.insert(rel, hash);
            }
            for (rel, hash) in &seen {
                match baseline.get(rel) {
                    Some(old) if old == hash => {}
                    _ => touched.changed.push(rel.clone()),
                }
            }
            for rel in baseline.keys() {
                if !seen.contains_key(rel) {
                    touched.deleted.push(rel.clone());
                }
            }
            touched.changed.sort();
            touched.deleted.sort();
            Ok::<_, anyhow::Error>(touched)
        })
        .await?
    }

    /// Whitelisted merge: copy exactly the touched files back into the real
    /// workspace, apply deletions, then discard the copy.
    pub async fn merge_back(self) -> anyhow::Result<MergeReport> {
        let touched = self.touched_files().await?;
        let mut merged = Vec::new();

        for rel in &touched.changed {
            let from = self.copy_root.join(rel);
            let to = self.real_root.join(rel);
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&from, &to).await?;
            debug!(file = %rel.display(), "merged from sandbox");
            merged.push(rel.clone());
        }
        for rel in &touched.deleted {
            let target = self.real_root.join(rel);
            if target.exists() {
                tokio::fs::remove_file(&target).await?;
            }
        }

        let report = MergeReport {
            merged,
            deleted: touched.deleted.clone(),
        };
        self.discard().await?;
        Ok(report)
    }

    /// Drop the copy without touching the real workspace.
    pub async fn discard(self) -> anyhow::Result<()> {
        if self.copy_root.exists() {
            tokio::fs::remove_dir_all(&self.copy_root).await?;
        }
        Ok(())
    }
}

fn copy_tree(
    from: &Path,
    to: &Path,
    extra_ignore: &[String],
) -> anyhow::Result<(HashMap<PathBuf, String>, usize)> {
    std::fs::create_dir_all(to)?;
    let mut baseline = HashMap::new();
    let mut copied = 0usize;
    for file in walk_files(from, extra_ignore) {
        let rel = file.strip_prefix(from).unwrap_or(&file).to_path_buf();
        let dest = to.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&file, &dest)?;
        baseline.insert(rel, hash_file(&file)?);
        copied += 1;
    }
    Ok((baseline, copied))
}

fn walk_files(root: &Path, extra_ignore: &[String]) -> Vec<PathBuf> {
    let extra = extra_ignore.to_vec();
    WalkDir::new(root)
        .into_iter()
        .filter_entry(move |e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir() && fs_utils::is_ignored_dir(&name, &extra))
        })
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn hash_file(path: &Path) -> anyhow::Result<String> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}
