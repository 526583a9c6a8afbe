use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::traits::Tool;

use super::fs_utils;
use super::schema::{ArgSpec, ArgType, ValidatedArgs};
use super::undo::UndoLog;
use super::{SideEffect, ToolSpec};

const MAX_CONTENT_SIZE: usize = 1024 * 1024; // 1MB

/// Write or create a file inside the workspace. Atomic (temp-then-rename),
/// with the pre-mutation content journaled for hash-verified undo.
pub struct WriteFileTool {
    workspace: PathBuf,
    undo: Arc<UndoLog>,
}

impl WriteFileTool {
    pub fn new(workspace: PathBuf, undo: Arc<UndoLog>) -> Self {
        Self { workspace, undo }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file".to_string(),
            description: "Write content to a file, creating it if missing. Existing content is \
                          journaled so the change can be undone."
                .to_string(),
            args: vec![
                ArgSpec::required("path", ArgType::String, "Path relative to the workspace root"),
                ArgSpec::required("content", ArgType::String, "Full content to write"),
                ArgSpec::optional(
                    "create_dirs",
                    ArgType::Boolean,
                    "Create missing parent directories",
                )
                .with_default(json!(false)),
            ],
            example_args: json!({"path": "notes/todo.md", "content": "- item\n"}),
            side_effects: vec![SideEffect::Write],
            visible_to_model: true,
            callable: true,
        }
    }

    async fn call(&self, args: &ValidatedArgs) -> anyhow::Result<Value> {
        let path_str = args
            .str("path")
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;
        let content = args
            .str("content")
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;
        let create_dirs = args.bool("create_dirs").unwrap_or(false);

        if content.len() > MAX_CONTENT_SIZE {
            anyhow::bail!(
                "content too large: {} bytes (max {MAX_CONTENT_SIZE})",
                content.len()
            );
        }

        let path = fs_utils::resolve_in_workspace(&self.workspace, path_str)?;
        if fs_utils::is_sensitive_path(&path) {
            anyhow::bail!("refusing to write to sensitive path: {path_str}");
        }

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                if create_dirs {
                    tokio::fs::create_dir_all(parent).await?;
                } else {
                    anyhow::bail!(
                        "parent directory does not exist: {}; set create_dirs=true",
                        parent.display()
                    );
                }
            }
        }

        let before = self.undo.snapshot_before(&path).await?;
        let existed = before.hash.is_some();

        // Temp-then-rename so a crash mid-write never leaves a torn file.
        let tmp = path.with_file_name(format!(
            ".{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "write".to_string())
        ));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let undo_id = self.undo.record(&path, before).await?;

        Ok(json!({
            "path": path_str,
            "bytes_written": content.len(),
            "created": !existed,
            "undo_id": undo_id,
        }))
    }
}
