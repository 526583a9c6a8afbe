//! Plan generation against the model-call capability.

use std::fmt;

use tracing::{debug, warn};

use crate::providers::{ChainExhausted, FailoverChain};
use crate::traits::ChatMessage;
use crate::utils::extract_json_object;

use super::{Plan, PlanParseError};

/// Why plan generation failed for the turn.
#[derive(Debug)]
pub enum PlanGenerationError {
    /// Every parse retry produced something unusable.
    RetriesExhausted { attempts: usize, last_error: String },
    /// The provider chain itself is down; retrying the parse cannot help.
    Provider(ChainExhausted),
}

impl fmt::Display for PlanGenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanGenerationError::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "plan parsing failed after {attempts} attempts: {last_error}"
            ),
            PlanGenerationError::Provider(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PlanGenerationError {}

fn planning_prompt(goal: &str, max_steps: usize) -> Vec<ChatMessage> {
    let system = format!(
        "You are the planning stage of a workspace coding agent. Break the goal into at most \
         {max_steps} ordered steps. Reply with ONLY a JSON object of this shape:\n\
         {{\"title\": \"...\", \"steps\": [{{\"id\": \"1\", \"description\": \"...\", \
         \"dependencies\": [], \"tools_expected\": []}}], \"verification\": \"touched\"}}\n\
         Step ids must be unique. dependencies lists ids of steps that must finish first. \
         tools_expected is an optional hint. Do not call tools; do not add prose."
    );
    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!("Goal: {goal}")),
    ]
}

/// Detect a planning reply that is itself a disguised tool call:
/// a top-level `tool` key (or `name` + `arguments`) and no `steps`.
/// Best-effort — this recovers one known failure shape, nothing more.
fn disguised_tool_call(value: &serde_json::Value) -> Option<String> {
    let obj = value.as_object()?;
    if obj.contains_key("steps") {
        return None;
    }
    if let Some(tool) = obj.get("tool").and_then(|v| v.as_str()) {
        return Some(tool.to_string());
    }
    if obj.contains_key("arguments") {
        if let Some(name) = obj.get("name").and_then(|v| v.as_str()) {
            return Some(name.to_string());
        }
    }
    None
}

/// Generate a plan for `goal`, retrying malformed replies up to
/// `retry_budget` times. Exhausting the budget is a fatal stop for the turn;
/// the caller surfaces it as `plan_parse_failed`.
pub async fn generate_plan(
    chain: &FailoverChain,
    goal: &str,
    retry_budget: usize,
    max_steps: usize,
) -> Result<Plan, PlanGenerationError> {
    let mut messages = planning_prompt(goal, max_steps);
    let mut last_error = String::from("no reply");
    let attempts = retry_budget + 1;

    for attempt in 0..attempts {
        let outcome = chain
            .chat(&messages)
            .await
            .map_err(PlanGenerationError::Provider)?;
        let reply = outcome.response.content;

        match extract_json_object(&reply) {
            Some(value) => {
                if let Some(tool) = disguised_tool_call(&value) {
                    // Deliberate leniency: don't hard-fail on this one shape.
                    warn!(tool = %tool, "planning reply was a disguised tool call; converting");
                    return Ok(Plan::single_step(goal, &tool));
                }
                match Plan::parse(&value, max_steps) {
                    Ok(plan) => {
                        debug!(steps = plan.steps.len(), attempt, "plan parsed");
                        return Ok(plan);
                    }
                    Err(err @ PlanParseError::DuplicateStepId(_))
                    | Err(err @ PlanParseError::UnknownDependency { .. })
                    | Err(err @ PlanParseError::NoSteps)
                    | Err(err @ PlanParseError::Malformed(_)) => {
                        last_error = err.to_string();
                    }
                }
            }
            None => {
                last_error = "reply contained no JSON object".to_string();
            }
        }

        warn!(attempt, error = %last_error, "plan rejected; retrying");
        messages.push(ChatMessage::assistant(reply));
        messages.push(ChatMessage::user(format!(
            "That plan was rejected: {last_error}. Reply again with ONLY the corrected JSON \
             object, unique step ids, at most {max_steps} steps."
        )));
    }

    Err(PlanGenerationError::RetriesExhausted {
        attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scripted_chain;

    #[tokio::test]
    async fn test_valid_plan_first_try() {
        let chain = scripted_chain(vec![
            r#"{"title": "t", "steps": [{"id": "1", "description": "do it"}]}"#,
        ]);
        let plan = generate_plan(&chain, "do it", 2, 10).await.unwrap();
        assert_eq!(plan.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_duplicate_ids() {
        let chain = scripted_chain(vec![
            r#"{"steps": [{"id": "1", "description": "a"}, {"id": "1", "description": "b"}]}"#,
            r#"{"steps": [{"id": "1", "description": "a"}, {"id": "2", "description": "b"}]}"#,
        ]);
        let plan = generate_plan(&chain, "goal", 2, 10).await.unwrap();
        assert_eq!(plan.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_disguised_tool_call_converted() {
        let chain = scripted_chain(vec![r#"{"tool": "read_file", "arguments": {"path": "x"}}"#]);
        let plan = generate_plan(&chain, "inspect x", 2, 10).await.unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tools_expected, vec!["read_file"]);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_is_fatal() {
        let chain = scripted_chain(vec!["not json", "still not json", "nope"]);
        let err = generate_plan(&chain, "goal", 2, 10).await.unwrap_err();
        assert!(matches!(
            err,
            PlanGenerationError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_oversized_plan_truncated() {
        let steps: Vec<String> = (0..15)
            .map(|i| format!(r#"{{"id": "{i}", "description": "step {i}"}}"#))
            .collect();
        let reply = format!(r#"{{"steps": [{}]}}"#, steps.join(","));
        let chain = scripted_chain(vec![&reply]);
        let plan = generate_plan(&chain, "goal", 0, 6).await.unwrap();
        assert_eq!(plan.steps.len(), 6);
    }

    #[tokio::test]
    async fn test_provider_outage_not_retried_as_parse() {
        let chain = scripted_chain(vec![]);
        let err = generate_plan(&chain, "goal", 5, 10).await.unwrap_err();
        assert!(matches!(err, PlanGenerationError::Provider(_)));
    }
}
