use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::traits::Tool;
use crate::utils::truncate_with_note;

use super::path_tracker::PathTracker;
use super::schema::{ArgSpec, ArgType, ValidatedArgs};
use super::{SideEffect, ToolSpec};

const MAX_OUTPUT_BYTES: usize = 64 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_TIMEOUT_SECS: i64 = 600;

/// Run a shell command in the workspace. The command has already passed the
/// dispatcher's safety screen and confirmation gate by the time it gets here.
pub struct RunCommandTool {
    workspace: PathBuf,
    tracker: Arc<PathTracker>,
}

impl RunCommandTool {
    pub fn new(workspace: PathBuf, tracker: Arc<PathTracker>) -> Self {
        Self { workspace, tracker }
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_command".to_string(),
            description: "Run a shell command in the workspace and return stdout/stderr. \
                          Destructive commands are blocked by policy."
                .to_string(),
            args: vec![
                ArgSpec::required("command", ArgType::String, "Shell command line to run"),
                ArgSpec::optional(
                    "timeout_secs",
                    ArgType::Integer,
                    "Seconds before the command is killed",
                ),
            ],
            example_args: json!({"command": "cargo check", "timeout_secs": 120}),
            side_effects: vec![SideEffect::Exec],
            visible_to_model: true,
            callable: true,
        }
    }

    async fn call(&self, args: &ValidatedArgs) -> anyhow::Result<Value> {
        let command = args
            .str("command")
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: command"))?;
        let timeout_secs = args
            .i64("timeout_secs")
            .unwrap_or(DEFAULT_TIMEOUT_SECS as i64)
            .clamp(1, MAX_TIMEOUT_SECS) as u64;

        // Advisory: warn when a modifying segment targets never-observed paths.
        let warning = self
            .tracker
            .check_modifying_command(&self.workspace, command)
            .await;

        debug!(command, timeout_secs, "running workspace command");
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stdout).await;
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        })
        .await;

        let (status, stdout, stderr) = match result {
            Ok(inner) => inner?,
            Err(_) => {
                anyhow::bail!("command timed out after {timeout_secs}s: {command}");
            }
        };

        // Successful read-only segments make their paths "seen".
        self.tracker
            .record_from_command(&self.workspace, command)
            .await;

        let stdout = clip(&stdout);
        let stderr = clip(&stderr);
        let mut payload = json!({
            "command": command,
            "exit_code": status.code(),
            "stdout": stdout,
            "stderr": stderr,
        });
        if let Some(w) = warning {
            payload["warning"] = json!(w.message);
        }
        Ok(payload)
    }
}

fn clip(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_OUTPUT_BYTES)]);
    truncate_with_note(&text, MAX_OUTPUT_BYTES / 4)
}
