//! Step executor — the turn state machine.
//!
//! Drives one plan to completion or to a terminal stop reason. The outer
//! loop walks steps in plan order with dependency gating and deadlock
//! detection; the inner loop is bounded by `max_step_tool_calls` model
//! decisions per step. Iteration ceilings are the cancellation mechanism:
//! exceeding any of them is a defined, reason-coded stop, never an unbounded
//! loop.

mod decision;
mod react;

pub use decision::{decode_decision, has_runaway_repetition, ModelDecision};

use std::collections::HashSet;
use std::path::PathBuf;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::{ExecutorConfig, ToolsConfig};
use crate::context::ContextManager;
use crate::events::{
    EventEmitter, EventType, PolicyDenialData, ReplanTriggeredData, StateTransitionData,
    StepEventData, TokenUsageData, ToolCallData, ToolResultData, VerificationEventData,
};
use crate::planner::{replan, Plan, PlanGenerationError, PlanStep, StepStatus, VerificationPolicy};
use crate::providers::FailoverChain;
use crate::tools::{fs_utils, Dispatcher};
use crate::verifier::Verifier;

/// Single active state per turn, surfaced as an event stream for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Intake,
    Planning,
    Executing,
    Verifying,
    Recovering,
    WaitingForApproval,
    Done,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Intake => "intake",
            AgentState::Planning => "planning",
            AgentState::Executing => "executing",
            AgentState::Verifying => "verifying",
            AgentState::Recovering => "recovering",
            AgentState::WaitingForApproval => "waiting_for_approval",
            AgentState::Done => "done",
        }
    }
}

/// Reason-coded terminal stop for a turn. User-visible failure behavior is
/// always one of these codes, never a bare stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    PlanParseFailed,
    ReplanParseFailed,
    MaxReplansReached,
    DependencyDeadlock,
    ReactLimitReached,
    ApprovalPending,
    ApprovalRejected,
    ProviderUnavailable,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::PlanParseFailed => "plan_parse_failed",
            StopReason::ReplanParseFailed => "replan_parse_failed",
            StopReason::MaxReplansReached => "max_replans_reached",
            StopReason::DependencyDeadlock => "dependency_deadlock",
            StopReason::ReactLimitReached => "react_limit_reached",
            StopReason::ApprovalPending => "approval_pending",
            StopReason::ApprovalRejected => "approval_rejected",
            StopReason::ProviderUnavailable => "provider_unavailable",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StopReason::Completed)
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            StopReason::Completed => "Task completed.",
            StopReason::PlanParseFailed => {
                "Could not obtain a valid plan from the model (plan_parse_failed). \
                 Try rephrasing or narrowing the request."
            }
            StopReason::ReplanParseFailed => {
                "Recovery planning failed to produce a usable plan (replan_parse_failed)."
            }
            StopReason::MaxReplansReached => {
                "The replan budget was exhausted without completing the task \
                 (max_replans_reached)."
            }
            StopReason::DependencyDeadlock => {
                "The plan deadlocked: every remaining step is blocked on unmet dependencies \
                 (dependency_deadlock)."
            }
            StopReason::ReactLimitReached => {
                "The action loop hit its iteration ceiling before finishing \
                 (react_limit_reached)."
            }
            StopReason::ApprovalPending => {
                "This task requires approval. It is paused and can be resumed once the \
                 recorded request is approved (approval_pending)."
            }
            StopReason::ApprovalRejected => "Approval was rejected; nothing was executed.",
            StopReason::ProviderUnavailable => {
                "No model provider could complete the request (provider_unavailable)."
            }
        }
    }
}

/// Iteration ceilings and decode thresholds for one turn.
#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    pub max_step_tool_calls: usize,
    pub max_replans: usize,
    pub plan_retry_budget: usize,
    pub max_plan_steps: usize,
    pub react_iteration_cap: usize,
    pub runaway_bracket_threshold: usize,
    pub max_output_chars: usize,
}

impl ExecutorLimits {
    pub fn from_config(executor: &ExecutorConfig, tools: &ToolsConfig) -> Self {
        Self {
            max_step_tool_calls: executor.max_step_tool_calls,
            max_replans: executor.max_replans,
            plan_retry_budget: executor.plan_retry_budget,
            max_plan_steps: executor.max_plan_steps,
            react_iteration_cap: executor.react_iteration_cap,
            runaway_bracket_threshold: executor.runaway_bracket_threshold,
            max_output_chars: tools.max_output_chars,
        }
    }
}

/// Outcome of one executor run.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub stop: StopReason,
    pub answer: Option<String>,
}

impl TurnOutcome {
    pub fn new(stop: StopReason, answer: Option<String>) -> Self {
        Self { stop, answer }
    }

    /// The text shown to the user: the answer when there is one, the
    /// reason-coded message otherwise.
    pub fn user_text(&self) -> String {
        match &self.answer {
            Some(answer) => answer.clone(),
            None => self.stop.user_message().to_string(),
        }
    }
}

/// Instructions appended wherever the model must answer with a decision
/// object.
pub(crate) const DECISION_INSTRUCTIONS: &str = "\
Respond with exactly one JSON object, nothing else:\n\
- {\"action\": \"tool_call\", \"tool\": \"<name>\", \"arguments\": {...}} to use a tool\n\
- {\"action\": \"step_done\", \"summary\": \"...\"} when this step is finished\n\
- {\"action\": \"replan\", \"reason\": \"...\"} if the plan cannot work as written";

enum StepRun {
    Done(String),
    Failed(String),
    Fatal(StopReason),
}

pub struct StepExecutor<'a> {
    chain: &'a FailoverChain,
    dispatcher: &'a Dispatcher,
    context: &'a mut ContextManager,
    emitter: EventEmitter,
    verifier: &'a Verifier,
    workspace: PathBuf,
    limits: ExecutorLimits,
    allowed_tools: Option<HashSet<String>>,
    state: AgentState,
    /// Files mutated this turn, as reported by tool payloads.
    touched: Vec<PathBuf>,
    /// Last provider-chain failure, surfaced in the final answer.
    provider_failure: Option<String>,
}

impl<'a> StepExecutor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: &'a FailoverChain,
        dispatcher: &'a Dispatcher,
        context: &'a mut ContextManager,
        emitter: EventEmitter,
        verifier: &'a Verifier,
        workspace: PathBuf,
        limits: ExecutorLimits,
        allowed_tools: Option<HashSet<String>>,
    ) -> Self {
        Self {
            chain,
            dispatcher,
            context,
            emitter,
            verifier,
            workspace,
            limits,
            allowed_tools,
            state: AgentState::Intake,
            touched: Vec::new(),
            provider_failure: None,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn touched_files(&self) -> &[PathBuf] {
        &self.touched
    }

    pub(crate) async fn transition(&mut self, to: AgentState) {
        if self.state == to {
            return;
        }
        self.emitter
            .emit_payload(
                EventType::StateTransition,
                &StateTransitionData {
                    from: self.state.as_str().to_string(),
                    to: to.as_str().to_string(),
                },
            )
            .await;
        self.state = to;
    }

    /// Drive a plan to completion or a terminal stop.
    pub async fn run_plan(&mut self, goal: &str, mut plan: Plan) -> TurnOutcome {
        self.transition(AgentState::Executing).await;
        let mut replans_used = 0usize;
        let mut last_summary = String::new();

        'plans: loop {
            // Passes over the current plan. A pass with no executable step
            // and unfinished work is a deadlock — this must never spin.
            loop {
                let mut executed_this_pass = false;

                for idx in 0..plan.steps.len() {
                    if matches!(
                        plan.steps[idx].status,
                        StepStatus::Done | StepStatus::Failed
                    ) {
                        continue;
                    }

                    let done = plan.done_ids();
                    let deps_met = plan.steps[idx]
                        .dependencies
                        .iter()
                        .all(|d| done.contains(d));
                    if !deps_met {
                        plan.steps[idx].status = StepStatus::Blocked;
                        continue;
                    }

                    plan.steps[idx].status = StepStatus::InProgress;
                    let step = plan.steps[idx].clone();
                    self.emitter
                        .emit_payload(
                            EventType::StepStarted,
                            &StepEventData {
                                step_id: step.id.clone(),
                                description: step.description.clone(),
                            },
                        )
                        .await;

                    let plan_text = plan.format_for_prompt();
                    match self.run_step(goal, &plan_text, &step).await {
                        StepRun::Done(summary) => {
                            plan.steps[idx].status = StepStatus::Done;
                            executed_this_pass = true;
                            last_summary = summary;
                            self.emitter
                                .emit_payload(
                                    EventType::StepCompleted,
                                    &StepEventData {
                                        step_id: step.id.clone(),
                                        description: step.description.clone(),
                                    },
                                )
                                .await;
                        }
                        StepRun::Failed(reason) => {
                            plan.steps[idx].status = StepStatus::Failed;
                            self.emitter
                                .emit_payload(
                                    EventType::StepFailed,
                                    &StepEventData {
                                        step_id: step.id.clone(),
                                        description: reason.clone(),
                                    },
                                )
                                .await;

                            match self.try_replan(goal, &plan, &step, &reason, replans_used).await {
                                ReplanOutcome::NewPlan(new_plan) => {
                                    replans_used += 1;
                                    self.emitter
                                        .emit_payload(
                                            EventType::ReplanTriggered,
                                            &ReplanTriggeredData {
                                                failed_step: step.id.clone(),
                                                replans_used,
                                                new_plan_id: Some(new_plan.id.clone()),
                                            },
                                        )
                                        .await;
                                    plan = new_plan;
                                    self.context.push_user(format!(
                                        "The plan was regenerated after a failure.\n{}",
                                        plan.format_for_prompt()
                                    ));
                                    self.transition(AgentState::Executing).await;
                                    continue 'plans;
                                }
                                ReplanOutcome::BudgetSpent => {
                                    self.emitter
                                        .emit_payload(
                                            EventType::ReplanTriggered,
                                            &ReplanTriggeredData {
                                                failed_step: step.id.clone(),
                                                replans_used,
                                                new_plan_id: None,
                                            },
                                        )
                                        .await;
                                    return self.finish(StopReason::MaxReplansReached, None).await;
                                }
                                ReplanOutcome::Fatal(stop) => {
                                    let answer = self.provider_failure.take();
                                    return self.finish(stop, answer).await;
                                }
                            }
                        }
                        StepRun::Fatal(stop) => {
                            let answer = self.provider_failure.take();
                            return self.finish(stop, answer).await;
                        }
                    }
                }

                let all_done = plan
                    .steps
                    .iter()
                    .all(|s| s.status == StepStatus::Done);
                if all_done {
                    break 'plans;
                }
                if !executed_this_pass {
                    warn!("all remaining steps blocked; declaring deadlock");
                    return self.finish(StopReason::DependencyDeadlock, None).await;
                }
            }
        }

        let verification_note = self.verify_at_completion(&plan).await;
        let mut answer = format!("Plan \"{}\" completed ({} steps).", plan.title, plan.steps.len());
        if !last_summary.is_empty() {
            answer.push_str(&format!(" {last_summary}"));
        }
        if let Some(note) = verification_note {
            answer.push_str(&format!("\n{note}"));
        }
        self.finish(StopReason::Completed, Some(answer)).await
    }

    /// Inner loop for one step: bounded model decisions, each decoded into
    /// exactly one branch before any business logic runs.
    async fn run_step(&mut self, goal: &str, plan_text: &str, step: &PlanStep) -> StepRun {
        self.context.push_user(format!(
            "Goal: {goal}\n\n{plan_text}\n\nExecute step {}: {}\n\n{DECISION_INSTRUCTIONS}",
            step.id, step.description
        ));

        for iteration in 0..self.limits.max_step_tool_calls {
            let reply = match self.model_reply().await {
                Ok(reply) => reply,
                Err(stop) => return StepRun::Fatal(stop),
            };

            match decode_decision(&reply, self.limits.runaway_bracket_threshold) {
                ModelDecision::ToolCall { name, arguments } => {
                    self.context.push_assistant(reply);
                    self.handle_tool_call(Some(&step.id), &name, arguments).await;
                }
                ModelDecision::StepDone { summary } => {
                    self.context.push_assistant(reply);
                    return StepRun::Done(summary);
                }
                ModelDecision::ReplanRequest { reason } => {
                    self.context.push_assistant(reply);
                    return StepRun::Failed(format!("model requested replan: {reason}"));
                }
                ModelDecision::Unparseable { reason } => {
                    // The raw reply is not echoed back; a corrective
                    // instruction replaces it. Does not consume a replan.
                    info!(iteration, reason = %reason, "unparseable reply; issuing corrective");
                    self.context.push_user(format!(
                        "Your last reply could not be used ({reason}).\n{DECISION_INSTRUCTIONS}"
                    ));
                }
            }
        }

        StepRun::Failed(format!(
            "iteration budget exhausted ({} decisions without step_done)",
            self.limits.max_step_tool_calls
        ))
    }

    async fn try_replan(
        &mut self,
        goal: &str,
        plan: &Plan,
        failed_step: &PlanStep,
        reason: &str,
        replans_used: usize,
    ) -> ReplanOutcome {
        self.transition(AgentState::Recovering).await;
        match replan(
            self.chain,
            goal,
            plan,
            failed_step,
            reason,
            replans_used,
            self.limits.max_replans,
            self.limits.plan_retry_budget,
            self.limits.max_plan_steps,
        )
        .await
        {
            Ok(Some(new_plan)) => ReplanOutcome::NewPlan(new_plan),
            Ok(None) => ReplanOutcome::BudgetSpent,
            Err(PlanGenerationError::Provider(err)) => {
                self.provider_failure = Some(err.user_message());
                ReplanOutcome::Fatal(StopReason::ProviderUnavailable)
            }
            Err(err @ PlanGenerationError::RetriesExhausted { .. }) => {
                warn!(error = %err, "replan parsing failed");
                ReplanOutcome::Fatal(StopReason::ReplanParseFailed)
            }
        }
    }

    /// One model call over current context, with compaction, failover and
    /// usage events handled here.
    pub(crate) async fn model_reply(&mut self) -> Result<String, StopReason> {
        if self.context.should_compact() {
            let report = self.context.compact();
            self.emitter
                .emit(
                    EventType::ContextCompacted,
                    serde_json::json!({
                        "before_tokens": report.before_tokens,
                        "after_tokens": report.after_tokens,
                        "compressed": report.compressed,
                        "evicted": report.evicted,
                    }),
                )
                .await;
        }

        match self.chain.chat(&self.context.to_messages()).await {
            Ok(outcome) => {
                for event in &outcome.failovers {
                    self.emitter
                        .emit_payload(
                            EventType::ProviderFailover,
                            &crate::events::ProviderFailoverData {
                                from: event.from.clone(),
                                to: event.to.clone(),
                                reason: event.reason.clone(),
                            },
                        )
                        .await;
                }
                if let Some(usage) = &outcome.response.usage {
                    self.emitter
                        .emit_payload(
                            EventType::TokenUsage,
                            &TokenUsageData {
                                provider: outcome.provider.clone(),
                                model: usage.model.clone(),
                                input_tokens: usage.input_tokens,
                                output_tokens: usage.output_tokens,
                            },
                        )
                        .await;
                }
                Ok(outcome.response.content)
            }
            Err(exhausted) => {
                self.provider_failure = Some(exhausted.user_message());
                Err(StopReason::ProviderUnavailable)
            }
        }
    }

    /// Dispatch one tool call and feed the structured result back into
    /// context. Mutating calls get an immediate scoped verification pass.
    pub(crate) async fn handle_tool_call(
        &mut self,
        step_id: Option<&str>,
        name: &str,
        arguments: Value,
    ) {
        self.emitter
            .emit_payload(
                EventType::ToolCall,
                &ToolCallData {
                    name: name.to_string(),
                    arguments: arguments.clone(),
                    step_id: step_id.map(str::to_string),
                },
            )
            .await;

        let result = self
            .dispatcher
            .dispatch(name, &arguments, self.allowed_tools.as_ref())
            .await;

        self.emitter
            .emit_payload(
                EventType::ToolResult,
                &ToolResultData {
                    name: name.to_string(),
                    ok: result.ok,
                    error_code: result.error_code().map(|c| c.as_str().to_string()),
                },
            )
            .await;

        if result.is_denied() {
            let reason = result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "denied".to_string());
            self.emitter
                .emit_payload(
                    EventType::PolicyDenial,
                    &PolicyDenialData {
                        tool: name.to_string(),
                        reason: reason.clone(),
                    },
                )
                .await;
            // A denial is a hard no, fed back explicitly — never retried
            // automatically and never silently skipped.
            self.context.push_tool_result(format!(
                "{name}: {reason}\nThis action was denied by policy. Do not retry it; \
                 choose a different approach or finish the step."
            ));
            return;
        }

        let text = result.render_for_model(self.limits.max_output_chars);
        self.context.push_tool_result(format!("{name}: {text}"));

        if result.ok {
            if let Some(spec) = self.dispatcher.registry().spec(name) {
                if spec.is_mutating() {
                    self.record_touched(&result.payload);
                    self.verify_after_mutation().await;
                }
            }
        }
    }

    fn record_touched(&mut self, payload: &Option<Value>) {
        let Some(path) = payload
            .as_ref()
            .and_then(|p| p.get("path"))
            .and_then(|p| p.as_str())
        else {
            return;
        };
        if let Ok(resolved) = fs_utils::resolve_in_workspace(&self.workspace, path) {
            if !self.touched.contains(&resolved) {
                self.touched.push(resolved);
            }
        }
    }

    /// Scoped check right after a mutation; failures become corrective
    /// context, not a stop.
    async fn verify_after_mutation(&mut self) {
        let Some(last) = self.touched.last().cloned() else {
            return;
        };
        let previous = self.state;
        self.transition(AgentState::Verifying).await;
        let report = self.verifier.check_files(&[last]).await;
        self.emitter
            .emit_payload(
                if report.ok {
                    EventType::VerificationPassed
                } else {
                    EventType::VerificationFailed
                },
                &VerificationEventData {
                    checked_files: report.checked_files,
                    failure_count: report.failures.len(),
                },
            )
            .await;
        if !report.ok {
            self.context
                .push_tool_result(report.format_for_context(self.verifier.max_reported()));
        }
        self.transition(previous).await;
    }

    /// Plan-completion verification per the plan's policy.
    async fn verify_at_completion(&mut self, plan: &Plan) -> Option<String> {
        if self.touched.is_empty() || plan.verification_policy == VerificationPolicy::None {
            return None;
        }
        self.transition(AgentState::Verifying).await;
        let touched = self.touched.clone();
        let report = self
            .verifier
            .check(&touched, Some(plan.verification_policy))
            .await;
        self.emitter
            .emit_payload(
                if report.ok {
                    EventType::VerificationPassed
                } else {
                    EventType::VerificationFailed
                },
                &VerificationEventData {
                    checked_files: report.checked_files,
                    failure_count: report.failures.len(),
                },
            )
            .await;
        if report.ok {
            None
        } else {
            let summary = report.format_for_context(self.verifier.max_reported());
            self.context.push_tool_result(summary.clone());
            Some(summary)
        }
    }

    async fn finish(&mut self, stop: StopReason, answer: Option<String>) -> TurnOutcome {
        self.transition(AgentState::Done).await;
        TurnOutcome::new(stop, answer)
    }
}

enum ReplanOutcome {
    NewPlan(Plan),
    BudgetSpent,
    Fatal(StopReason),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, VerifyConfig};
    use crate::planner::Plan;
    use crate::testing::scripted_chain;
    use crate::tools::schema::{ArgSpec, ArgType, ValidatedArgs};
    use crate::tools::{Dispatcher, SideEffect, ToolRegistry, ToolSpec};
    use crate::traits::Tool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct NoteTool;

    #[async_trait]
    impl Tool for NoteTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "note".to_string(),
                description: "Record a note".to_string(),
                args: vec![ArgSpec::required("text", ArgType::String, "Note text")],
                example_args: json!({"text": "x"}),
                side_effects: vec![SideEffect::Read],
                visible_to_model: true,
                callable: true,
            }
        }

        async fn call(&self, args: &ValidatedArgs) -> anyhow::Result<Value> {
            Ok(json!(format!("noted: {}", args.str("text").unwrap_or(""))))
        }
    }

    fn limits() -> ExecutorLimits {
        ExecutorLimits {
            max_step_tool_calls: 4,
            max_replans: 2,
            plan_retry_budget: 1,
            max_plan_steps: 10,
            react_iteration_cap: 6,
            runaway_bracket_threshold: 60,
            max_output_chars: 4000,
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(NoteTool)).unwrap();
        Dispatcher::new(Arc::new(registry), None, Vec::new(), None)
    }

    fn context() -> ContextManager {
        let mut ctx = ContextManager::new(&ContextConfig::default());
        ctx.push_system("You are a workspace agent.");
        ctx
    }

    fn verifier(dir: &std::path::Path) -> Verifier {
        Verifier::new(&VerifyConfig::default(), dir.to_path_buf())
    }

    fn plan(steps: serde_json::Value) -> Plan {
        Plan::parse(&json!({"title": "t", "steps": steps}), 10).unwrap()
    }

    #[tokio::test]
    async fn test_single_step_plan_completes() {
        let dir = tempfile::tempdir().unwrap();
        let chain = scripted_chain(vec![
            r#"{"action": "tool_call", "tool": "note", "arguments": {"text": "hi"}}"#,
            r#"{"action": "step_done", "summary": "note recorded"}"#,
        ]);
        let d = dispatcher();
        let mut ctx = context();
        let v = verifier(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits(),
            None,
        );
        let plan = plan(json!([{"id": "1", "description": "take a note"}]));
        let outcome = exec.run_plan("take a note", plan).await;
        assert_eq!(outcome.stop, StopReason::Completed);
        assert!(outcome.user_text().contains("note recorded"));
        assert_eq!(exec.state(), AgentState::Done);
    }

    #[tokio::test]
    async fn test_dependency_order_and_blocking() {
        let dir = tempfile::tempdir().unwrap();
        // Step b depends on a; a completes first pass, b on the second.
        let chain = scripted_chain(vec![
            r#"{"action": "step_done", "summary": "a done"}"#,
            r#"{"action": "step_done", "summary": "b done"}"#,
        ]);
        let d = dispatcher();
        let mut ctx = context();
        let v = verifier(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits(),
            None,
        );
        // b listed before a: dependency gating must still run a first.
        let plan = plan(json!([
            {"id": "b", "description": "second", "dependencies": ["a"]},
            {"id": "a", "description": "first"},
        ]));
        let outcome = exec.run_plan("ordered work", plan).await;
        assert_eq!(outcome.stop, StopReason::Completed);
    }

    #[tokio::test]
    async fn test_dependency_deadlock_detected() {
        let dir = tempfile::tempdir().unwrap();
        let chain = scripted_chain(vec![]);
        let d = dispatcher();
        let mut ctx = context();
        let v = verifier(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits(),
            None,
        );
        // a and b depend on each other; nothing can ever run.
        let plan = plan(json!([
            {"id": "a", "description": "one", "dependencies": ["b"]},
            {"id": "b", "description": "two", "dependencies": ["a"]},
        ]));
        let outcome = exec.run_plan("impossible", plan).await;
        assert_eq!(outcome.stop, StopReason::DependencyDeadlock);
    }

    #[tokio::test]
    async fn test_replan_request_consumes_replan_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let chain = scripted_chain(vec![
            // step asks for replan
            r#"{"action": "replan", "reason": "wrong approach"}"#,
            // replanner answers with a fresh single-step plan
            r#"{"title": "recovery", "steps": [{"id": "r1", "description": "simpler route"}]}"#,
            // which then completes
            r#"{"action": "step_done", "summary": "recovered"}"#,
        ]);
        let d = dispatcher();
        let mut ctx = context();
        let v = verifier(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits(),
            None,
        );
        let plan = plan(json!([{"id": "1", "description": "doomed step"}]));
        let outcome = exec.run_plan("goal", plan).await;
        assert_eq!(outcome.stop, StopReason::Completed);
        assert!(outcome.user_text().contains("recovered"));
    }

    #[tokio::test]
    async fn test_max_replans_reached_stops_turn() {
        let dir = tempfile::tempdir().unwrap();
        let mut limits = limits();
        limits.max_replans = 0;
        let chain = scripted_chain(vec![r#"{"action": "replan", "reason": "nope"}"#]);
        let d = dispatcher();
        let mut ctx = context();
        let v = verifier(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits,
            None,
        );
        let plan = plan(json!([{"id": "1", "description": "step"}]));
        let outcome = exec.run_plan("goal", plan).await;
        assert_eq!(outcome.stop, StopReason::MaxReplansReached);
    }

    #[tokio::test]
    async fn test_unparseable_reply_gets_corrective_not_replan() {
        let dir = tempfile::tempdir().unwrap();
        let chain = scripted_chain(vec![
            "I think I should probably look around first.",
            r#"{"action": "step_done", "summary": "done after corrective"}"#,
        ]);
        let d = dispatcher();
        let mut ctx = context();
        let v = verifier(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits(),
            None,
        );
        let plan = plan(json!([{"id": "1", "description": "step"}]));
        let outcome = exec.run_plan("goal", plan).await;
        assert_eq!(outcome.stop, StopReason::Completed);
    }

    #[tokio::test]
    async fn test_iteration_exhaustion_fails_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut limits = limits();
        limits.max_step_tool_calls = 2;
        limits.max_replans = 0;
        // Model keeps calling the tool and never signals step_done.
        let call = r#"{"action": "tool_call", "tool": "note", "arguments": {"text": "again"}}"#;
        let chain = scripted_chain(vec![call, call]);
        let d = dispatcher();
        let mut ctx = context();
        let v = verifier(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits,
            None,
        );
        let plan = plan(json!([{"id": "1", "description": "loops"}]));
        let outcome = exec.run_plan("goal", plan).await;
        assert_eq!(outcome.stop, StopReason::MaxReplansReached);
    }

    #[tokio::test]
    async fn test_provider_outage_is_reason_coded() {
        let dir = tempfile::tempdir().unwrap();
        let chain = scripted_chain(vec![]);
        let d = dispatcher();
        let mut ctx = context();
        let v = verifier(dir.path());
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t"),
            &v,
            dir.path().to_path_buf(),
            limits(),
            None,
        );
        let plan = plan(json!([{"id": "1", "description": "step"}]));
        let outcome = exec.run_plan("goal", plan).await;
        assert_eq!(outcome.stop, StopReason::ProviderUnavailable);
        assert!(outcome.user_text().contains("provider"));
    }

    #[tokio::test]
    async fn test_denied_tool_fed_back_as_hard_no() {
        let dir = tempfile::tempdir().unwrap();
        let chain = scripted_chain(vec![
            r#"{"action": "tool_call", "tool": "note", "arguments": {"text": "x"}}"#,
            r#"{"action": "step_done", "summary": "gave up on the tool"}"#,
        ]);
        let d = {
            let mut registry = ToolRegistry::new();
            registry.register(Arc::new(NoteTool)).unwrap();
            Dispatcher::new(Arc::new(registry), None, vec!["note".to_string()], None)
        };
        let mut ctx = context();
        let v = verifier(dir.path());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut exec = StepExecutor::new(
            &chain,
            &d,
            &mut ctx,
            EventEmitter::new("t").with_observer(tx),
            &v,
            dir.path().to_path_buf(),
            limits(),
            None,
        );
        let plan = plan(json!([{"id": "1", "description": "step"}]));
        let outcome = exec.run_plan("goal", plan).await;
        assert_eq!(outcome.stop, StopReason::Completed);

        let mut saw_denial = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == EventType::PolicyDenial {
                saw_denial = true;
            }
        }
        assert!(saw_denial);
        let all: String = ctx.items().iter().map(|i| i.content.as_str()).collect();
        assert!(all.contains("denied by policy"));
    }
}
