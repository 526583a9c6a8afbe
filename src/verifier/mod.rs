//! Post-mutation workspace self-checks.
//!
//! After any write/exec tool call, and once at plan completion when code was
//! modified, the verifier runs checks scoped to the files touched this turn
//! where possible. Failures are fed back into context as a structured
//! summary so the model can self-correct — they never auto-stop the turn.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VerifyConfig;
use crate::planner::VerificationPolicy;
use crate::utils::truncate_str;

/// One failing check, pinned to a file and line when the source allows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyFailure {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    pub ok: bool,
    pub checked_files: usize,
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    fn passing(checked_files: usize) -> Self {
        Self {
            ok: true,
            checked_files,
            failures: Vec::new(),
        }
    }

    /// Structured failure summary for context injection: first N errors with
    /// file/line/message.
    pub fn format_for_context(&self, max_reported: usize) -> String {
        if self.ok {
            return format!("verification passed ({} files checked)", self.checked_files);
        }
        let mut lines = vec![format!(
            "verification failed: {} problem(s), showing first {}:",
            self.failures.len(),
            self.failures.len().min(max_reported)
        )];
        for failure in self.failures.iter().take(max_reported) {
            match failure.line {
                Some(line) => lines.push(format!(
                    "  {}:{}: {}",
                    failure.file, line, failure.message
                )),
                None => lines.push(format!("  {}: {}", failure.file, failure.message)),
            }
        }
        lines.join("\n")
    }
}

/// `file:line[:col]: message` — the shape most compilers and linters print.
static FILE_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*([^\s:]+\.[a-zA-Z0-9]+):(\d+)(?::\d+)?:?\s*(.+)$")
        .expect("static regex")
});

/// Cargo-style `--> file:line:col` location lines.
static CARGO_ARROW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-->\s*([^\s:]+):(\d+)").expect("static regex"));

pub struct Verifier {
    workspace: PathBuf,
    policy: VerificationPolicy,
    command: Option<String>,
    max_reported: usize,
    timeout: Duration,
}

impl Verifier {
    pub fn new(config: &VerifyConfig, workspace: PathBuf) -> Self {
        Self {
            workspace,
            policy: VerificationPolicy::from_str(&config.policy).unwrap_or_default(),
            command: config.command.clone(),
            max_reported: config.max_reported,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn max_reported(&self) -> usize {
        self.max_reported
    }

    /// Default policy from config, overridable per plan.
    pub fn effective_policy(&self, plan_policy: Option<VerificationPolicy>) -> VerificationPolicy {
        plan_policy.unwrap_or(self.policy)
    }

    /// Quick per-file checks after a single mutation.
    pub async fn check_files(&self, touched: &[PathBuf]) -> VerifyReport {
        let mut failures = Vec::new();
        let mut checked = 0;
        for path in touched {
            checked += 1;
            failures.extend(check_one_file(&self.workspace, path).await);
        }
        VerifyReport {
            ok: failures.is_empty(),
            checked_files: checked,
            failures,
        }
    }

    /// Full pass per the effective policy: file checks plus the configured
    /// workspace command when one is set.
    pub async fn check(
        &self,
        touched: &[PathBuf],
        plan_policy: Option<VerificationPolicy>,
    ) -> VerifyReport {
        match self.effective_policy(plan_policy) {
            VerificationPolicy::None => VerifyReport::passing(0),
            VerificationPolicy::Touched => {
                let mut report = self.check_files(touched).await;
                if let Some(command_report) = self.run_command_check().await {
                    report.checked_files += command_report.checked_files;
                    report.failures.extend(command_report.failures);
                    report.ok = report.failures.is_empty();
                }
                report
            }
            VerificationPolicy::Full => {
                let mut report = self.check_files(touched).await;
                match self.run_command_check().await {
                    Some(command_report) => {
                        report.checked_files += command_report.checked_files;
                        report.failures.extend(command_report.failures);
                        report.ok = report.failures.is_empty();
                        report
                    }
                    None => report,
                }
            }
        }
    }

    async fn run_command_check(&self) -> Option<VerifyReport> {
        let command = self.command.as_ref()?;
        debug!(command = %command, "running verify command");

        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.workspace)
                .stdin(Stdio::null())
                .output(),
        )
        .await;

        let report = match output {
            Ok(Ok(output)) if output.status.success() => VerifyReport::passing(1),
            Ok(Ok(output)) => {
                let text = format!(
                    "{}\n{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                let mut failures = parse_error_lines(&text);
                if failures.is_empty() {
                    failures.push(VerifyFailure {
                        file: "<workspace>".to_string(),
                        line: None,
                        message: format!(
                            "verify command failed: {}",
                            truncate_str(text.trim(), 300)
                        ),
                    });
                }
                VerifyReport {
                    ok: false,
                    checked_files: 1,
                    failures,
                }
            }
            Ok(Err(e)) => VerifyReport {
                ok: false,
                checked_files: 0,
                failures: vec![VerifyFailure {
                    file: "<workspace>".to_string(),
                    line: None,
                    message: format!("verify command could not run: {e}"),
                }],
            },
            Err(_) => VerifyReport {
                ok: false,
                checked_files: 0,
                failures: vec![VerifyFailure {
                    file: "<workspace>".to_string(),
                    line: None,
                    message: format!("verify command timed out after {:?}", self.timeout),
                }],
            },
        };
        Some(report)
    }
}

/// Built-in per-file checks: readable UTF-8, plus format validation for
/// json/toml where a parse failure pinpoints the problem.
async fn check_one_file(workspace: &Path, path: &Path) -> Vec<VerifyFailure> {
    let display = path
        .strip_prefix(workspace)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();

    if !path.exists() {
        return vec![VerifyFailure {
            file: display,
            line: None,
            message: "touched file no longer exists".to_string(),
        }];
    }

    let content = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return vec![VerifyFailure {
                file: display,
                line: None,
                message: format!("unreadable: {e}"),
            }];
        }
    };

    let Ok(text) = String::from_utf8(content) else {
        // Binary artifacts are fine; only flag when the extension says text.
        let texty = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("rs" | "toml" | "json" | "md" | "txt" | "py" | "js" | "ts" | "yaml" | "yml")
        );
        if texty {
            return vec![VerifyFailure {
                file: display,
                line: None,
                message: "not valid UTF-8".to_string(),
            }];
        }
        return Vec::new();
    };

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(_) => Vec::new(),
            Err(e) => vec![VerifyFailure {
                file: display,
                line: Some(e.line() as u32),
                message: format!("invalid JSON: {e}"),
            }],
        },
        Some("toml") => match toml::from_str::<toml::Value>(&text) {
            Ok(_) => Vec::new(),
            Err(e) => vec![VerifyFailure {
                file: display,
                line: None,
                message: format!("invalid TOML: {}", truncate_str(&e.to_string(), 200)),
            }],
        },
        _ => Vec::new(),
    }
}

/// Extract file/line/message triples from compiler-style output.
fn parse_error_lines(text: &str) -> Vec<VerifyFailure> {
    let mut failures = Vec::new();

    for caps in FILE_LINE_RE.captures_iter(text) {
        let message = caps[3].trim().to_string();
        // Skip pure location echoes with no message content.
        if message.is_empty() {
            continue;
        }
        failures.push(VerifyFailure {
            file: caps[1].to_string(),
            line: caps[2].parse().ok(),
            message,
        });
    }

    if failures.is_empty() {
        // Cargo prints the message on one line and the location on the next.
        let mut pending_message: Option<String> = None;
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("error") {
                pending_message = Some(trimmed.to_string());
            } else if let Some(caps) = CARGO_ARROW_RE.captures(trimmed) {
                if let Some(message) = pending_message.take() {
                    failures.push(VerifyFailure {
                        file: caps[1].to_string(),
                        line: caps[2].parse().ok(),
                        message,
                    });
                }
            }
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier_in(dir: &Path, command: Option<&str>) -> Verifier {
        Verifier::new(
            &VerifyConfig {
                policy: "touched".to_string(),
                command: command.map(str::to_string),
                max_reported: 5,
                timeout_secs: 10,
            },
            dir.to_path_buf(),
        )
    }

    #[tokio::test]
    async fn test_valid_files_pass() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ok.json");
        tokio::fs::write(&file, r#"{"a": 1}"#).await.unwrap();
        let report = verifier_in(dir.path(), None).check_files(&[file]).await;
        assert!(report.ok);
        assert_eq!(report.checked_files, 1);
    }

    #[tokio::test]
    async fn test_invalid_json_flagged_with_line() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.json");
        tokio::fs::write(&file, "{\n  \"a\": ,\n}").await.unwrap();
        let report = verifier_in(dir.path(), None).check_files(&[file]).await;
        assert!(!report.ok);
        assert_eq!(report.failures[0].file, "bad.json");
        assert!(report.failures[0].line.is_some());
    }

    #[tokio::test]
    async fn test_invalid_toml_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.toml");
        tokio::fs::write(&file, "key = ").await.unwrap();
        let report = verifier_in(dir.path(), None).check_files(&[file]).await;
        assert!(!report.ok);
    }

    #[tokio::test]
    async fn test_missing_touched_file_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let report = verifier_in(dir.path(), None)
            .check_files(&[dir.path().join("gone.rs")])
            .await;
        assert!(!report.ok);
        assert!(report.failures[0].message.contains("no longer exists"));
    }

    #[tokio::test]
    async fn test_failing_command_produces_failures() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = verifier_in(
            dir.path(),
            Some("echo 'src/lib.rs:12: unused variable' >&2; exit 1"),
        );
        let report = verifier.check(&[], None).await;
        assert!(!report.ok);
        assert_eq!(report.failures[0].file, "src/lib.rs");
        assert_eq!(report.failures[0].line, Some(12));
    }

    #[tokio::test]
    async fn test_none_policy_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = verifier_in(dir.path(), Some("exit 1"));
        let report = verifier
            .check(&[], Some(VerificationPolicy::None))
            .await;
        assert!(report.ok);
    }

    #[test]
    fn test_parse_cargo_style_output() {
        let text = "error[E0425]: cannot find value `x`\n --> src/main.rs:10:5\n";
        let failures = parse_error_lines(text);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].file, "src/main.rs");
        assert_eq!(failures[0].line, Some(10));
    }

    #[test]
    fn test_format_for_context_caps_output() {
        let report = VerifyReport {
            ok: false,
            checked_files: 1,
            failures: (0..10)
                .map(|i| VerifyFailure {
                    file: format!("f{i}.rs"),
                    line: Some(i),
                    message: "broken".to_string(),
                })
                .collect(),
        };
        let text = report.format_for_context(3);
        assert!(text.contains("f0.rs"));
        assert!(text.contains("f2.rs"));
        assert!(!text.contains("f3.rs"));
    }
}
