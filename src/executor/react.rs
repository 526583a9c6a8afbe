//! Fallback single-level ReAct loop for turns where planning was skipped.
//!
//! Same tool-call/result/feedback contract as the per-step inner loop, but
//! with no plan structure; bounded by a hard iteration ceiling.

use tracing::info;

use super::{decode_decision, AgentState, ModelDecision, StepExecutor, StopReason, TurnOutcome};

const REACT_INSTRUCTIONS: &str = "\
Work on the request with tools as needed. Respond with exactly one JSON object per turn:\n\
- {\"action\": \"tool_call\", \"tool\": \"<name>\", \"arguments\": {...}} to use a tool\n\
- {\"action\": \"step_done\", \"summary\": \"<your final answer>\"} when finished\n\
If no tool is needed, answer directly with step_done.";

impl StepExecutor<'_> {
    /// Plan-less tool loop: decide, act, observe, repeat — up to the hard
    /// ceiling. A plain-prose reply with no JSON in it counts as the final
    /// answer rather than a decode failure.
    pub async fn run_react(&mut self, goal: &str) -> TurnOutcome {
        self.transition(AgentState::Executing).await;
        self.context
            .push_user(format!("{goal}\n\n{REACT_INSTRUCTIONS}"));

        for iteration in 0..self.limits.react_iteration_cap {
            let reply = match self.model_reply().await {
                Ok(reply) => reply,
                Err(stop) => {
                    let answer = self.provider_failure.take();
                    return self.finish_react(stop, answer).await;
                }
            };

            match decode_decision(&reply, self.limits.runaway_bracket_threshold) {
                ModelDecision::ToolCall { name, arguments } => {
                    self.context.push_assistant(reply);
                    self.handle_tool_call(None, &name, arguments).await;
                }
                ModelDecision::StepDone { summary } => {
                    self.context.push_assistant(reply);
                    return self
                        .finish_react(StopReason::Completed, Some(summary))
                        .await;
                }
                ModelDecision::ReplanRequest { .. } => {
                    // No plan to regenerate here; steer back to the contract.
                    self.context.push_assistant(reply);
                    self.context.push_user(
                        "No plan is active. Either call a tool or finish with step_done."
                            .to_string(),
                    );
                }
                ModelDecision::Unparseable { reason } => {
                    if !reply.contains('{') {
                        // Plain prose with no JSON attempt: the model chose
                        // to answer directly.
                        self.context.push_assistant(reply.clone());
                        return self.finish_react(StopReason::Completed, Some(reply)).await;
                    }
                    info!(iteration, reason = %reason, "unparseable react reply; issuing corrective");
                    self.context.push_user(format!(
                        "Your last reply could not be used ({reason}).\n{REACT_INSTRUCTIONS}"
                    ));
                }
            }
        }

        self.finish_react(StopReason::ReactLimitReached, None).await
    }

    async fn finish_react(&mut self, stop: StopReason, answer: Option<String>) -> TurnOutcome {
        self.transition(AgentState::Done).await;
        TurnOutcome::new(stop, answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, VerifyConfig};
    use crate::context::ContextManager;
    use crate::events::EventEmitter;
    use crate::executor::ExecutorLimits;
    use crate::testing::scripted_chain;
    use crate::tools::schema::{ArgSpec, ArgType, ValidatedArgs};
    use crate::tools::{Dispatcher, SideEffect, ToolRegistry, ToolSpec};
    use crate::traits::Tool;
    use crate::verifier::Verifier;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "Echo".to_string(),
                args: vec![ArgSpec::required("text", ArgType::String, "Text")],
                example_args: json!({"text": "x"}),
                side_effects: vec![SideEffect::Read],
                visible_to_model: true,
                callable: true,
            }
        }

        async fn call(&self, args: &ValidatedArgs) -> anyhow::Result<Value> {
            Ok(json!(args.str("text").unwrap_or("").to_uppercase()))
        }
    }

    fn limits(cap: usize) -> ExecutorLimits {
        ExecutorLimits {
            max_step_tool_calls: 4,
            max_replans: 1,
            plan_retry_budget: 1,
            max_plan_steps: 10,
            react_iteration_cap: cap,
            runaway_bracket_threshold: 60,
            max_output_chars: 4000,
        }
    }

    fn harness(dir: &std::path::Path) -> (Dispatcher, ContextManager, Verifier) {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry), None, Vec::new(), None);
        let mut ctx = ContextManager::new(&ContextConfig::default());
        ctx.push_system("You are a workspace agent.");
        let verifier = Verifier::new(&VerifyConfig::default(), dir.to_path_buf());
        (dispatcher, ctx, verifier)
    }

    #[tokio::test]
    async fn test_react_tool_then_answer() {
        let dir = tempfile::tempdir().unwrap();
        let chain = scripted_chain(vec![
            r#"{"action": "tool_call", "tool": "echo", "arguments": {"text": "hi"}}"#,
            r#"{"action": "step_done", "summary": "It says HI."}"#,
        ]);
        let (d, mut ctx, v) = harness(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits(6),
            None,
        );
        let outcome = exec.run_react("shout hi").await;
        assert_eq!(outcome.stop, StopReason::Completed);
        assert_eq!(outcome.user_text(), "It says HI.");
        let all: String = ctx.items().iter().map(|i| i.content.as_str()).collect();
        assert!(all.contains("HI"));
    }

    #[tokio::test]
    async fn test_react_plain_prose_is_final_answer() {
        let dir = tempfile::tempdir().unwrap();
        let chain = scripted_chain(vec!["The workspace looks healthy to me."]);
        let (d, mut ctx, v) = harness(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits(6),
            None,
        );
        let outcome = exec.run_react("how does it look?").await;
        assert_eq!(outcome.stop, StopReason::Completed);
        assert!(outcome.user_text().contains("healthy"));
    }

    #[tokio::test]
    async fn test_react_hard_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let call = r#"{"action": "tool_call", "tool": "echo", "arguments": {"text": "x"}}"#;
        let chain = scripted_chain(vec![call, call, call]);
        let (d, mut ctx, v) = harness(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits(3),
            None,
        );
        let outcome = exec.run_react("loop forever").await;
        assert_eq!(outcome.stop, StopReason::ReactLimitReached);
        assert!(outcome.user_text().contains("react_limit_reached"));
    }
}
