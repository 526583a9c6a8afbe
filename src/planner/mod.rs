//! Plan model and structured-plan parsing.
//!
//! A plan is created once per planning pass and discarded on replan — a
//! replan produces a brand-new plan, never a patch to the old one. Step ids
//! must be unique within a plan; a duplicate is a hard parse failure, not a
//! warning.

mod generation;
mod recovery;

pub use generation::{generate_plan, PlanGenerationError};
pub use recovery::replan;

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::truncate_str;

/// How the verifier runs after this plan completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    None,
    #[default]
    Touched,
    Full,
}

impl VerificationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationPolicy::None => "none",
            VerificationPolicy::Touched => "touched",
            VerificationPolicy::Full => "full",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(VerificationPolicy::None),
            "touched" => Some(VerificationPolicy::Touched),
            "full" => Some(VerificationPolicy::Full),
            _ => None,
        }
    }
}

/// Status of a single step. A step is never re-entered once Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    /// Unmet dependency at selection time; re-checked each pass.
    Blocked,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
            StepStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    /// Ids of steps that must be Done before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hint only — never enforced at dispatch time.
    #[serde(default)]
    pub tools_expected: Vec<String>,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub steps: Vec<PlanStep>,
    pub verification_policy: VerificationPolicy,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum PlanParseError {
    /// Not a JSON object, or missing/mistyped fields.
    Malformed(String),
    DuplicateStepId(String),
    /// A dependency names a step id that does not exist — it could never be
    /// satisfied.
    UnknownDependency { step: String, dependency: String },
    NoSteps,
}

impl fmt::Display for PlanParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanParseError::Malformed(reason) => write!(f, "malformed plan: {reason}"),
            PlanParseError::DuplicateStepId(id) => {
                write!(f, "duplicate step id in plan: {id}")
            }
            PlanParseError::UnknownDependency { step, dependency } => {
                write!(f, "step {step} depends on unknown step {dependency}")
            }
            PlanParseError::NoSteps => write!(f, "plan contains no steps"),
        }
    }
}

impl std::error::Error for PlanParseError {}

impl Plan {
    /// Parse a model-produced plan object. Duplicate step ids and unknown
    /// dependency targets are hard failures; step count above `max_steps` is
    /// truncated, not rejected.
    pub fn parse(raw: &Value, max_steps: usize) -> Result<Self, PlanParseError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| PlanParseError::Malformed("expected a JSON object".to_string()))?;

        let title = obj
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("untitled plan")
            .to_string();

        let raw_steps = obj
            .get("steps")
            .and_then(|v| v.as_array())
            .ok_or_else(|| PlanParseError::Malformed("missing steps array".to_string()))?;
        if raw_steps.is_empty() {
            return Err(PlanParseError::NoSteps);
        }

        let mut steps = Vec::new();
        for raw_step in raw_steps.iter().take(max_steps) {
            let step_obj = raw_step.as_object().ok_or_else(|| {
                PlanParseError::Malformed("step entries must be objects".to_string())
            })?;
            let id = match step_obj.get("id") {
                Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    return Err(PlanParseError::Malformed(
                        "step is missing a usable id".to_string(),
                    ))
                }
            };
            let description = step_obj
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    PlanParseError::Malformed(format!("step {id} is missing a description"))
                })?;
            let dependencies = string_list(step_obj.get("dependencies"));
            let tools_expected = string_list(step_obj.get("tools_expected"));
            steps.push(PlanStep {
                id,
                description,
                dependencies,
                tools_expected,
                status: StepStatus::Pending,
            });
        }

        // Uniqueness is validated before any step executes — never
        // silently deduplicated.
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(PlanParseError::DuplicateStepId(step.id.clone()));
            }
        }

        // Dependencies on steps truncated away are dropped rather than
        // failing the whole plan; dependencies on ids that never existed are
        // hard failures.
        let all_ids_in_source: HashSet<String> = raw_steps
            .iter()
            .filter_map(|s| s.as_object())
            .filter_map(|o| match o.get("id") {
                Some(Value::String(s)) => Some(s.trim().to_string()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .collect();
        let kept_ids: HashSet<String> = steps.iter().map(|s| s.id.clone()).collect();
        for step in &mut steps {
            let mut unknown: Option<String> = None;
            step.dependencies.retain(|dep| {
                if kept_ids.contains(dep) {
                    true
                } else if all_ids_in_source.contains(dep) {
                    false // truncated away with its step
                } else {
                    unknown = Some(dep.clone());
                    false
                }
            });
            if let Some(dependency) = unknown {
                return Err(PlanParseError::UnknownDependency {
                    step: step.id.clone(),
                    dependency,
                });
            }
        }

        let verification_policy = obj
            .get("verification")
            .and_then(|v| v.as_str())
            .and_then(VerificationPolicy::from_str)
            .unwrap_or_default();

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            title,
            steps,
            verification_policy,
            created_at: Utc::now(),
        })
    }

    /// Leniency path: a planning reply that was itself a disguised tool call
    /// becomes a single-step plan naming that tool.
    pub fn single_step(goal: &str, tool: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: truncate_str(goal, 80),
            steps: vec![PlanStep {
                id: "1".to_string(),
                description: format!("Use {tool} to address: {}", truncate_str(goal, 200)),
                dependencies: Vec::new(),
                tools_expected: vec![tool.to_string()],
                status: StepStatus::Pending,
            }],
            verification_policy: VerificationPolicy::default(),
            created_at: Utc::now(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn done_ids(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Done | StepStatus::Failed))
    }

    pub fn summary(&self) -> String {
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .count();
        format!("{} ({}/{} steps done)", self.title, done, self.steps.len())
    }

    /// Render for prompt injection.
    pub fn format_for_prompt(&self) -> String {
        let mut lines = vec![format!("## Plan: {}", self.title)];
        for step in &self.steps {
            let marker = match step.status {
                StepStatus::Done => "[x]",
                StepStatus::InProgress => "[>]",
                StepStatus::Failed => "[!]",
                StepStatus::Blocked => "[~]",
                StepStatus::Pending => "[ ]",
            };
            let mut line = format!("  {marker} {}. {}", step.id, step.description);
            if !step.dependencies.is_empty() {
                line.push_str(&format!(" (after {})", step.dependencies.join(", ")));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}
