use std::path::PathBuf;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::traits::Tool;
use crate::utils::truncate_str;

use super::fs_utils;
use super::schema::{ArgSpec, ArgType, ValidatedArgs};
use super::{SideEffect, ToolSpec};

const MAX_MATCHES: usize = 100;
const MAX_FILE_SIZE: u64 = 512 * 1024;

/// Regex search across workspace files, skipping the shared ignore dirs.
pub struct SearchFilesTool {
    workspace: PathBuf,
    extra_ignore: Vec<String>,
}

impl SearchFilesTool {
    pub fn new(workspace: PathBuf, extra_ignore: Vec<String>) -> Self {
        Self {
            workspace,
            extra_ignore,
        }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "search_files".to_string(),
            description: "Search workspace files for a regex pattern; returns file:line matches."
                .to_string(),
            args: vec![
                ArgSpec::required("pattern", ArgType::String, "Regex pattern to search for"),
                ArgSpec::optional(
                    "dir",
                    ArgType::String,
                    "Subdirectory to search (default: workspace root)",
                ),
                ArgSpec::optional(
                    "case_sensitive",
                    ArgType::Boolean,
                    "Case-sensitive matching",
                )
                .with_default(json!(false)),
            ],
            example_args: json!({"pattern": "fn main", "dir": "src"}),
            side_effects: vec![SideEffect::Read],
            visible_to_model: true,
            callable: true,
        }
    }

    async fn call(&self, args: &ValidatedArgs) -> anyhow::Result<Value> {
        let pattern = args
            .str("pattern")
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: pattern"))?;
        let case_sensitive = args.bool("case_sensitive").unwrap_or(false);
        let root = match args.str("dir") {
            Some(dir) => fs_utils::resolve_in_workspace(&self.workspace, dir)?,
            None => self.workspace.clone(),
        };
        if !root.exists() {
            anyhow::bail!("search directory not found: {}", root.display());
        }

        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid regex: {e}"))?;

        // The walk is synchronous; run it off the async executor.
        let extra = self.extra_ignore.clone();
        let workspace = self.workspace.clone();
        let matches = tokio::task::spawn_blocking(move || {
            let mut matches: Vec<(String, usize, String)> = Vec::new();
            let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !(e.file_type().is_dir() && fs_utils::is_ignored_dir(&name, &extra))
            });
            for entry in walker.flatten() {
                if matches.len() >= MAX_MATCHES {
                    break;
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.metadata().map(|m| m.len() > MAX_FILE_SIZE).unwrap_or(true) {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(entry.path()) else {
                    continue; // binary or unreadable
                };
                for (lineno, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        let rel = entry
                            .path()
                            .strip_prefix(&workspace)
                            .unwrap_or(entry.path())
                            .to_string_lossy()
                            .to_string();
                        matches.push((rel, lineno + 1, truncate_str(line.trim(), 200)));
                        if matches.len() >= MAX_MATCHES {
                            break;
                        }
                    }
                }
            }
            matches
        })
        .await?;

        if matches.is_empty() {
            return Ok(json!(format!("No matches for pattern: {pattern}")));
        }

        let mut lines: Vec<String> = matches
            .iter()
            .map(|(file, line, text)| format!("{file}:{line}: {text}"))
            .collect();
        if lines.len() >= MAX_MATCHES {
            lines.push(format!("... capped at {MAX_MATCHES} matches"));
        }
        Ok(json!(lines.join("\n")))
    }
}
