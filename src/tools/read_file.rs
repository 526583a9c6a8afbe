use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::traits::Tool;

use super::fs_utils;
use super::path_tracker::PathTracker;
use super::schema::{ArgSpec, ArgType, ValidatedArgs};
use super::{SideEffect, ToolSpec};

const MAX_FILE_SIZE: u64 = 256 * 1024; // 256KB

/// Read file contents with line numbers, confined to the workspace root.
pub struct ReadFileTool {
    workspace: PathBuf,
    tracker: Arc<PathTracker>,
}

impl ReadFileTool {
    pub fn new(workspace: PathBuf, tracker: Arc<PathTracker>) -> Self {
        Self { workspace, tracker }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read file contents with line numbers. Supports line range selection \
                          for large files."
                .to_string(),
            args: vec![
                ArgSpec::required("path", ArgType::String, "Path relative to the workspace root"),
                ArgSpec::optional(
                    "start_line",
                    ArgType::Integer,
                    "First line to read (1-based, inclusive)",
                ),
                ArgSpec::optional(
                    "end_line",
                    ArgType::Integer,
                    "Last line to read (1-based, inclusive)",
                ),
            ],
            example_args: json!({"path": "src/main.rs", "start_line": 1, "end_line": 40}),
            side_effects: vec![SideEffect::Read],
            visible_to_model: true,
            callable: true,
        }
    }

    async fn call(&self, args: &ValidatedArgs) -> anyhow::Result<Value> {
        let path_str = args
            .str("path")
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;
        let path = fs_utils::resolve_in_workspace(&self.workspace, path_str)?;

        if !path.exists() {
            anyhow::bail!("file not found: {path_str}");
        }
        let metadata = tokio::fs::metadata(&path).await?;
        if metadata.is_dir() {
            anyhow::bail!("path is a directory, not a file: {path_str}");
        }

        if fs_utils::is_binary_file(&path).await? {
            return Ok(json!(format!(
                "Binary file: {path_str} ({} bytes, cannot display contents)",
                metadata.len()
            )));
        }

        if metadata.len() > MAX_FILE_SIZE {
            anyhow::bail!(
                "file too large: {} bytes (max {MAX_FILE_SIZE}); use start_line/end_line",
                metadata.len()
            );
        }

        let content = tokio::fs::read_to_string(&path).await?;
        self.tracker.record_seen(&path).await;

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        if total == 0 {
            return Ok(json!(format!("File: {path_str} (0 lines, empty)")));
        }

        let start = args
            .i64("start_line")
            .map(|n| (n.max(1) as usize).saturating_sub(1))
            .unwrap_or(0);
        let end = args
            .i64("end_line")
            .map(|n| n.max(0) as usize)
            .unwrap_or(total)
            .min(total);

        if start >= total {
            anyhow::bail!("start_line {} exceeds total lines {total}", start + 1);
        }

        let selected = lines[start..end].join("\n");
        let formatted = fs_utils::format_with_line_numbers(&selected, start);
        let header = if start > 0 || end < total {
            format!("File: {path_str} (lines {}-{end} of {total})\n", start + 1)
        } else {
            format!("File: {path_str} ({total} lines)\n")
        };
        Ok(json!(format!("{header}{formatted}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_in(dir: &std::path::Path) -> ReadFileTool {
        ReadFileTool::new(dir.to_path_buf(), Arc::new(PathTracker::new()))
    }

    async fn call(tool: &ReadFileTool, args: Value) -> anyhow::Result<Value> {
        let validated = super::super::schema::validate(&tool.spec().args, &args).unwrap();
        tool.call(&validated).await
    }

    #[tokio::test]
    async fn test_read_basic() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n")
            .await
            .unwrap();
        let out = call(&tool_in(dir.path()), json!({"path": "a.txt"}))
            .await
            .unwrap();
        let text = out.as_str().unwrap();
        assert!(text.contains("one"));
        assert!(text.contains("3 lines"));
    }

    #[tokio::test]
    async fn test_read_line_range() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "a\nb\nc\nd\ne\n")
            .await
            .unwrap();
        let out = call(
            &tool_in(dir.path()),
            json!({"path": "a.txt", "start_line": 2, "end_line": 4}),
        )
        .await
        .unwrap();
        let text = out.as_str().unwrap();
        assert!(text.contains("| b"));
        assert!(text.contains("| d"));
        assert!(!text.contains("| a"));
        assert!(!text.contains("| e"));
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = call(&tool_in(dir.path()), json!({"path": "nope.txt"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_read_outside_workspace_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = call(&tool_in(dir.path()), json!({"path": "../escape.txt"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workspace"));
    }

    #[tokio::test]
    async fn test_read_binary_reported() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("bin"), [0xFFu8, 0x00, 0x10])
            .await
            .unwrap();
        let out = call(&tool_in(dir.path()), json!({"path": "bin"}))
            .await
            .unwrap();
        assert!(out.as_str().unwrap().contains("Binary file"));
    }
}
