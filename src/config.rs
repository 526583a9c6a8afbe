use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub intent: IntentConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Root directory the runtime is allowed to operate in.
    #[serde(default = "default_workspace_root")]
    pub root: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

fn default_workspace_root() -> String {
    ".".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Per-request timeout applied by the wire client.
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    /// Ordered failover chain; the first entry is the primary.
    #[serde(default)]
    pub chain: Vec<ProviderEntryConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_request_timeout_secs(),
            chain: Vec::new(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderEntryConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key. Secrets never live in the
    /// config file itself.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub model: String,
    /// Retries against this provider before failing over to the next.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    OpenaiCompatible,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    /// Inner-loop bound: model decisions per plan step.
    #[serde(default = "default_max_step_tool_calls")]
    pub max_step_tool_calls: usize,
    /// Replans allowed per turn before max_replans_reached.
    #[serde(default = "default_max_replans")]
    pub max_replans: usize,
    /// Parse retries inside one plan-generation call.
    #[serde(default = "default_plan_retry_budget")]
    pub plan_retry_budget: usize,
    /// Plans longer than this are truncated, not rejected.
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,
    /// Hard ceiling for the plan-less ReAct loop.
    #[serde(default = "default_react_iteration_cap")]
    pub react_iteration_cap: usize,
    /// Consecutive identical bracket/brace characters treated as runaway
    /// degenerate output.
    #[serde(default = "default_runaway_bracket_threshold")]
    pub runaway_bracket_threshold: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_step_tool_calls: default_max_step_tool_calls(),
            max_replans: default_max_replans(),
            plan_retry_budget: default_plan_retry_budget(),
            max_plan_steps: default_max_plan_steps(),
            react_iteration_cap: default_react_iteration_cap(),
            runaway_bracket_threshold: default_runaway_bracket_threshold(),
        }
    }
}

fn default_max_step_tool_calls() -> usize {
    8
}

fn default_max_replans() -> usize {
    2
}

fn default_plan_retry_budget() -> usize {
    2
}

fn default_max_plan_steps() -> usize {
    12
}

fn default_react_iteration_cap() -> usize {
    15
}

fn default_runaway_bracket_threshold() -> usize {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    /// Model context window, in estimated tokens.
    #[serde(default = "default_window_tokens")]
    pub window_tokens: usize,
    /// Fraction of the window that triggers compaction.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: f32,
    /// Tokens reserved for the model's completion when computing the
    /// compaction target.
    #[serde(default = "default_completion_reserve")]
    pub completion_reserve: usize,
    /// Most-recent turns kept verbatim during compaction.
    #[serde(default = "default_keep_recent_turns")]
    pub keep_recent_turns: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_tokens: default_window_tokens(),
            compact_threshold: default_compact_threshold(),
            completion_reserve: default_completion_reserve(),
            keep_recent_turns: default_keep_recent_turns(),
        }
    }
}

fn default_window_tokens() -> usize {
    16_000
}

fn default_compact_threshold() -> f32 {
    0.7
}

fn default_completion_reserve() -> usize {
    1024
}

fn default_keep_recent_turns() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    /// Global allow-list. None means every registered tool is allowed.
    #[serde(default)]
    pub allow: Option<Vec<String>>,
    /// Global deny-list, checked after the allow-list.
    #[serde(default)]
    pub deny: Vec<String>,
    /// Tool output larger than this is truncated before entering context.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allow: None,
            deny: Vec::new(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

fn default_max_output_chars() -> usize {
    12_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// Sqlite file for approval requests, plan snapshots and the event log.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "codewright.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerifyConfig {
    /// "none", "touched" or "full".
    #[serde(default = "default_verify_policy")]
    pub policy: String,
    /// Optional workspace check command (e.g. "cargo check").
    #[serde(default)]
    pub command: Option<String>,
    /// Errors reported back into context per failing check.
    #[serde(default = "default_max_reported")]
    pub max_reported: usize,
    #[serde(default = "default_verify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            policy: default_verify_policy(),
            command: None,
            max_reported: default_max_reported(),
            timeout_secs: default_verify_timeout_secs(),
        }
    }
}

fn default_verify_policy() -> String {
    "touched".to_string()
}

fn default_max_reported() -> usize {
    5
}

fn default_verify_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SandboxConfig {
    /// Extra directory names skipped when copying the workspace, merged with
    /// the built-in ignore table.
    #[serde(default)]
    pub ignore_dirs: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IntentConfig {
    /// Project-level intent rules, checked before the built-in table.
    #[serde(default)]
    pub rules: Vec<IntentRuleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntentRuleConfig {
    pub name: String,
    /// Keyword phrases matched on word boundaries.
    pub keywords: Vec<String>,
    /// Category name; must be one of the fixed category set.
    pub category: String,
    #[serde(default)]
    pub risk: Option<String>,
    /// Tool allow-list applied for the turn when this rule matches.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub planning: Option<bool>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.1..=0.95).contains(&self.context.compact_threshold) {
            anyhow::bail!(
                "context.compact_threshold must be in [0.1, 0.95], got {}",
                self.context.compact_threshold
            );
        }
        if self.context.completion_reserve >= self.context.window_tokens {
            anyhow::bail!("context.completion_reserve must be smaller than window_tokens");
        }
        if !matches!(self.verify.policy.as_str(), "none" | "touched" | "full") {
            anyhow::bail!(
                "verify.policy must be one of none|touched|full, got {:?}",
                self.verify.policy
            );
        }
        Ok(())
    }
}
