//! One orchestration instance: owns the registry, context manager, failover
//! chain, approval gate and verifier for a single workspace/session, and
//! drives user text through classify → plan → gate → execute → verify.
//!
//! All collaborators are injected — no package-level mutable globals.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::context::ContextManager;
use crate::events::{
    ApprovalEventData, EventEmitter, EventStore, IntentClassifiedData, PlanGeneratedData,
    SandboxEventData, TraceEvent, TurnCompletedData, TurnStartedData,
};
use crate::events::EventType;
use crate::executor::{ExecutorLimits, StepExecutor, StopReason, TurnOutcome};
use crate::intent::{Intent, IntentClassifier, IntentRule};
use crate::planner::{generate_plan, Plan, PlanGenerationError};
use crate::policy::{ApprovalGate, ApprovalPrompt, ApprovalStore, GateDecision, RiskLevel};
use crate::providers::{FailoverChain, OpenAiCompatibleProvider, ProviderEntry};
use crate::sandbox::Sandbox;
use crate::state::open_sqlite_pool;
use crate::tools::{
    Dispatcher, PathTracker, ReadFileTool, RunCommandTool, SearchFilesTool, SideEffect,
    ToolRegistry, UndoLog, WebFetchTool, WriteFileTool,
};
use crate::tools::ConfirmSender;
use crate::traits::ChatMessage;
use crate::verifier::Verifier;

/// Outcome of one full turn, keyed by its trace id.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub trace_id: String,
    pub stop: StopReason,
    pub answer: String,
}

pub struct Orchestrator {
    config: AppConfig,
    workspace: PathBuf,
    chain: Arc<FailoverChain>,
    classifier: IntentClassifier,
    gate: ApprovalGate,
    event_store: Arc<EventStore>,
    observer: Option<mpsc::UnboundedSender<TraceEvent>>,
    confirm: Option<ConfirmSender>,
}

impl Orchestrator {
    /// Build one instance from config. `resolver` answers approval prompts;
    /// `confirm` answers write/exec confirmations. Either may be absent, in
    /// which case the corresponding gate degrades to its safe default
    /// (pending approval, denied mutation).
    pub async fn new(
        config: AppConfig,
        resolver: Option<mpsc::Sender<ApprovalPrompt>>,
        confirm: Option<ConfirmSender>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let workspace = std::fs::canonicalize(&config.workspace.root)
            .map_err(|e| anyhow::anyhow!("workspace root {}: {e}", config.workspace.root))?;

        let chain = Arc::new(build_chain(&config)?);

        let project_rules = config
            .intent
            .rules
            .iter()
            .map(IntentRule::from_config)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let classifier = IntentClassifier::new(project_rules);

        let pool = open_sqlite_pool(&config.state.db_path).await?;
        let approval_store = Arc::new(ApprovalStore::new(pool.clone()).await?);
        let event_store = Arc::new(EventStore::new(pool).await?);
        let gate = ApprovalGate::new(approval_store, resolver);

        Ok(Self {
            config,
            workspace,
            chain,
            classifier,
            gate,
            event_store,
            observer: None,
            confirm,
        })
    }

    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<TraceEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.event_store
    }

    /// One full user-request-to-answer cycle.
    pub async fn handle_request(&self, user_text: &str) -> anyhow::Result<TurnReport> {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let emitter = self.emitter(&trace_id);
        emitter
            .emit_payload(
                EventType::TurnStarted,
                &TurnStartedData {
                    user_text: user_text.to_string(),
                },
            )
            .await;

        let intent = self.classifier.classify(&self.chain, user_text).await;
        emitter
            .emit_payload(
                EventType::IntentClassified,
                &IntentClassifiedData {
                    intent: intent.name.clone(),
                    category: intent.category.as_str().to_string(),
                    confidence: intent.confidence,
                    risk: intent.risk.as_str().to_string(),
                    planning_required: intent.planning_required,
                },
            )
            .await;
        info!(
            %trace_id,
            intent = %intent.name,
            category = intent.category.as_str(),
            "intent classified"
        );

        let outcome = if intent.category.is_conversational() {
            self.converse(user_text).await
        } else if !intent.planning_required {
            self.run_react_turn(&emitter, &intent, user_text).await
        } else {
            self.run_planned_turn(&emitter, &intent, user_text).await
        };

        self.complete(trace_id, emitter, outcome).await
    }

    /// Resume a turn whose approval was granted (or rejected) out-of-band.
    pub async fn resume_approval(&self, request_id: &str) -> anyhow::Result<TurnReport> {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let emitter = self.emitter(&trace_id);
        let (request, decision) = self.gate.resume(request_id).await?;
        emitter
            .emit_payload(
                EventType::ApprovalResolved,
                &ApprovalEventData {
                    request_id: request.id.clone(),
                    risk: request.risk.as_str().to_string(),
                    status: request.status.as_str().to_string(),
                },
            )
            .await;

        let outcome = match decision {
            GateDecision::Waiting { request_id } => TurnOutcome::new(
                StopReason::ApprovalPending,
                Some(format!(
                    "Approval request {request_id} is still pending; nothing was executed."
                )),
            ),
            GateDecision::Rejected { .. } => TurnOutcome::new(StopReason::ApprovalRejected, None),
            GateDecision::Proceed | GateDecision::ProceedSandboxed => {
                let plan: Plan = serde_json::from_value(request.plan_snapshot.clone())?;
                // The original tool scope is not persisted with the request;
                // the resumed run uses the full registry under the recorded
                // risk level.
                let goal = plan.title.clone();
                if request.risk.requires_sandbox() {
                    self.run_sandboxed(&emitter, None, &goal, plan).await
                } else {
                    self.run_in_workspace(&emitter, None, &goal, plan).await
                }
            }
        };

        self.complete(trace_id, emitter, outcome).await
    }

    fn emitter(&self, trace_id: &str) -> EventEmitter {
        let mut emitter = EventEmitter::new(trace_id).with_store(self.event_store.clone());
        if let Some(observer) = &self.observer {
            emitter = emitter.with_observer(observer.clone());
        }
        emitter
    }

    async fn complete(
        &self,
        trace_id: String,
        emitter: EventEmitter,
        outcome: TurnOutcome,
    ) -> anyhow::Result<TurnReport> {
        let answer = outcome.user_text();
        emitter
            .emit_payload(
                EventType::TurnCompleted,
                &TurnCompletedData {
                    stop_reason: outcome.stop.as_str().to_string(),
                    answer_chars: answer.chars().count(),
                },
            )
            .await;
        Ok(TurnReport {
            trace_id,
            stop: outcome.stop,
            answer,
        })
    }

    /// Conversational short-circuit: no planner, no tools.
    async fn converse(&self, user_text: &str) -> TurnOutcome {
        let messages = vec![
            ChatMessage::system(
                "You are a workspace coding agent. Answer conversationally and briefly. \
                 You are not executing tools in this turn.",
            ),
            ChatMessage::user(user_text),
        ];
        match self.chain.chat(&messages).await {
            Ok(outcome) => {
                TurnOutcome::new(StopReason::Completed, Some(outcome.response.content))
            }
            Err(exhausted) => {
                TurnOutcome::new(StopReason::ProviderUnavailable, Some(exhausted.user_message()))
            }
        }
    }

    async fn run_react_turn(
        &self,
        emitter: &EventEmitter,
        intent: &Intent,
        user_text: &str,
    ) -> TurnOutcome {
        let run = match self.build_run(&self.workspace, intent.allowed_tools.clone()) {
            Ok(run) => run,
            Err(e) => return config_failure(e),
        };
        let mut context = self.fresh_context(&run);
        let mut executor = self.executor(&run, &mut context, emitter.clone());
        executor.run_react(user_text).await
    }

    async fn run_planned_turn(
        &self,
        emitter: &EventEmitter,
        intent: &Intent,
        user_text: &str,
    ) -> TurnOutcome {
        let plan = match generate_plan(
            &self.chain,
            user_text,
            self.config.executor.plan_retry_budget,
            self.config.executor.max_plan_steps,
        )
        .await
        {
            Ok(plan) => plan,
            Err(PlanGenerationError::RetriesExhausted { last_error, .. }) => {
                emitter
                    .emit(EventType::PlanParseFailed, json!({ "error": last_error }))
                    .await;
                return TurnOutcome::new(StopReason::PlanParseFailed, None);
            }
            Err(PlanGenerationError::Provider(err)) => {
                return TurnOutcome::new(
                    StopReason::ProviderUnavailable,
                    Some(err.user_message()),
                );
            }
        };
        emitter
            .emit_payload(
                EventType::PlanGenerated,
                &PlanGeneratedData {
                    plan_id: plan.id.clone(),
                    title: plan.title.clone(),
                    step_count: plan.steps.len(),
                },
            )
            .await;

        // Risk merge and the approval gate.
        let exec_tools = self.exec_tool_names();
        let (risk, decision) = match self.gate.evaluate(intent, &plan, &exec_tools).await {
            Ok(result) => result,
            Err(e) => return config_failure(e),
        };

        match decision {
            GateDecision::Proceed => {
                if risk.requires_approval() {
                    self.emit_approval(emitter, risk, "approved").await;
                }
                self.run_in_workspace(emitter, intent.allowed_tools.clone(), user_text, plan)
                    .await
            }
            GateDecision::ProceedSandboxed => {
                self.emit_approval(emitter, risk, "approved").await;
                self.run_sandboxed(emitter, intent.allowed_tools.clone(), user_text, plan)
                    .await
            }
            GateDecision::Waiting { request_id } => {
                emitter
                    .emit_payload(
                        EventType::ApprovalRequested,
                        &ApprovalEventData {
                            request_id: request_id.clone(),
                            risk: risk.as_str().to_string(),
                            status: "pending".to_string(),
                        },
                    )
                    .await;
                TurnOutcome::new(
                    StopReason::ApprovalPending,
                    Some(format!(
                        "This {risk}-risk plan needs approval. Request id: {request_id}. \
                         Resume once it is approved."
                    )),
                )
            }
            GateDecision::Rejected { request_id } => {
                emitter
                    .emit_payload(
                        EventType::ApprovalResolved,
                        &ApprovalEventData {
                            request_id,
                            risk: risk.as_str().to_string(),
                            status: "rejected".to_string(),
                        },
                    )
                    .await;
                TurnOutcome::new(StopReason::ApprovalRejected, None)
            }
        }
    }

    async fn emit_approval(&self, emitter: &EventEmitter, risk: RiskLevel, status: &str) {
        emitter
            .emit_payload(
                EventType::ApprovalResolved,
                &ApprovalEventData {
                    request_id: String::new(),
                    risk: risk.as_str().to_string(),
                    status: status.to_string(),
                },
            )
            .await;
    }

    async fn run_in_workspace(
        &self,
        emitter: &EventEmitter,
        allowed_tools: Option<HashSet<String>>,
        goal: &str,
        plan: Plan,
    ) -> TurnOutcome {
        let run = match self.build_run(&self.workspace, allowed_tools) {
            Ok(run) => run,
            Err(e) => return config_failure(e),
        };
        let mut context = self.fresh_context(&run);
        let mut executor = self.executor(&run, &mut context, emitter.clone());
        executor.run_plan(goal, plan).await
    }

    /// Critical risk: the entire run executes against an isolated copy, and
    /// only a verified success is merged back.
    async fn run_sandboxed(
        &self,
        emitter: &EventEmitter,
        allowed_tools: Option<HashSet<String>>,
        goal: &str,
        plan: Plan,
    ) -> TurnOutcome {
        let sandbox = match Sandbox::create(&self.workspace, self.config.sandbox.ignore_dirs.clone())
            .await
        {
            Ok(sandbox) => sandbox,
            Err(e) => return config_failure(e),
        };

        let outcome = {
            let run = match self.build_run(sandbox.root(), allowed_tools) {
                Ok(run) => run,
                Err(e) => {
                    let _ = sandbox.discard().await;
                    return config_failure(e);
                }
            };
            let mut context = self.fresh_context(&run);
            let mut executor = self.executor(&run, &mut context, emitter.clone());
            executor.run_plan(goal, plan).await
        };

        let touched = match sandbox.touched_files().await {
            Ok(touched) => touched,
            Err(e) => {
                warn!(error = %e, "sandbox diff failed; discarding");
                let _ = sandbox.discard().await;
                return config_failure(e);
            }
        };

        // Merge only a verified success; anything else leaves the real
        // workspace untouched.
        let verified = outcome.stop.is_success() && {
            let verifier = Verifier::new(&self.config.verify, sandbox.root().to_path_buf());
            let absolute: Vec<PathBuf> =
                touched.changed.iter().map(|p| sandbox.root().join(p)).collect();
            verifier.check(&absolute, None).await.ok
        };

        if verified {
            match sandbox.merge_back().await {
                Ok(report) => {
                    emitter
                        .emit_payload(
                            EventType::SandboxMerged,
                            &SandboxEventData {
                                touched_files: report.merged.len() + report.deleted.len(),
                                reason: "verified success".to_string(),
                            },
                        )
                        .await;
                    outcome
                }
                Err(e) => {
                    warn!(error = %e, "sandbox merge failed; real workspace left untouched");
                    emitter
                        .emit_payload(
                            EventType::SandboxDiscarded,
                            &SandboxEventData {
                                touched_files: touched.count(),
                                reason: format!("merge failed: {e}"),
                            },
                        )
                        .await;
                    TurnOutcome::new(
                        outcome.stop,
                        Some(
                            "The sandboxed run succeeded but merging back failed; no changes \
                             were applied to the workspace."
                                .to_string(),
                        ),
                    )
                }
            }
        } else {
            let reason = if outcome.stop.is_success() {
                "verification failed".to_string()
            } else {
                format!("run stopped: {}", outcome.stop.as_str())
            };
            let _ = sandbox.discard().await;
            emitter
                .emit_payload(
                    EventType::SandboxDiscarded,
                    &SandboxEventData {
                        touched_files: touched.count(),
                        reason: reason.clone(),
                    },
                )
                .await;
            let mut answer = outcome.user_text();
            answer.push_str(&format!(
                "\nSandboxed changes were discarded ({reason}); the workspace is unchanged."
            ));
            TurnOutcome::new(outcome.stop, Some(answer))
        }
    }

    /// Per-run tool wiring bound to a workspace root (real or sandbox copy).
    fn build_run(
        &self,
        root: &Path,
        allowed_tools: Option<HashSet<String>>,
    ) -> anyhow::Result<RunParts> {
        let tracker = Arc::new(PathTracker::new());
        let undo = Arc::new(UndoLog::new(
            std::env::temp_dir().join(format!("undo-{}", uuid::Uuid::new_v4().simple())),
        ));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ReadFileTool::new(
            root.to_path_buf(),
            tracker.clone(),
        )))?;
        registry.register(Arc::new(WriteFileTool::new(
            root.to_path_buf(),
            undo.clone(),
        )))?;
        registry.register(Arc::new(SearchFilesTool::new(
            root.to_path_buf(),
            self.config.sandbox.ignore_dirs.clone(),
        )))?;
        registry.register(Arc::new(RunCommandTool::new(
            root.to_path_buf(),
            tracker.clone(),
        )))?;
        registry.register(Arc::new(
            WebFetchTool::new(Duration::from_secs(self.config.provider.timeout_secs))
                .map_err(|e| anyhow::anyhow!(e))?,
        ))?;

        let registry = Arc::new(registry);
        let dispatcher = Dispatcher::new(
            registry.clone(),
            self.config.tools.allow.clone(),
            self.config.tools.deny.clone(),
            self.confirm.clone(),
        );
        let verifier = Verifier::new(&self.config.verify, root.to_path_buf());

        Ok(RunParts {
            root: root.to_path_buf(),
            registry,
            dispatcher,
            verifier,
            allowed_tools,
        })
    }

    fn fresh_context(&self, run: &RunParts) -> ContextManager {
        let mut context = ContextManager::new(&self.config.context);
        context.push_system(system_prompt(&run.registry, run.allowed_tools.as_ref()));
        context
    }

    fn executor<'a>(
        &'a self,
        run: &'a RunParts,
        context: &'a mut ContextManager,
        emitter: EventEmitter,
    ) -> StepExecutor<'a> {
        StepExecutor::new(
            &self.chain,
            &run.dispatcher,
            context,
            emitter,
            &run.verifier,
            run.root.clone(),
            ExecutorLimits::from_config(&self.config.executor, &self.config.tools),
            run.allowed_tools.clone(),
        )
    }

    fn exec_tool_names(&self) -> HashSet<String> {
        // The built-in set is static; only run_command carries Exec today.
        // Derived from specs so added tools stay covered.
        let run = self.build_run(&self.workspace, None);
        match run {
            Ok(run) => run
                .registry
                .visible_specs(None)
                .into_iter()
                .filter(|s| s.has_side_effect(SideEffect::Exec))
                .map(|s| s.name)
                .collect(),
            Err(_) => ["run_command".to_string()].into_iter().collect(),
        }
    }
}

struct RunParts {
    root: PathBuf,
    registry: Arc<ToolRegistry>,
    dispatcher: Dispatcher,
    verifier: Verifier,
    allowed_tools: Option<HashSet<String>>,
}

fn config_failure(e: anyhow::Error) -> TurnOutcome {
    warn!(error = %e, "turn failed before execution");
    TurnOutcome::new(
        StopReason::ProviderUnavailable,
        Some(format!("The runtime could not start this turn: {e}")),
    )
}

fn build_chain(config: &AppConfig) -> anyhow::Result<FailoverChain> {
    let timeout = Duration::from_secs(config.provider.timeout_secs);
    let mut entries = Vec::new();
    for entry in &config.provider.chain {
        let api_key = std::env::var(&entry.api_key_env).unwrap_or_default();
        let provider =
            OpenAiCompatibleProvider::new(&entry.name, &entry.base_url, api_key, timeout)
                .map_err(|e| anyhow::anyhow!(e))?;
        entries.push(ProviderEntry {
            provider: Arc::new(provider),
            model: entry.model.clone(),
            max_retries: entry.max_retries,
        });
    }
    Ok(FailoverChain::new(entries, Duration::from_secs(1)))
}

/// System prompt: identity, contract, and the visible tool catalog narrowed
/// to the turn's allow-list.
fn system_prompt(registry: &ToolRegistry, allow: Option<&HashSet<String>>) -> String {
    let mut out = String::from(
        "You are a workspace coding agent. You operate strictly inside the workspace root, \
         follow the decision protocol you are given, and never invent tool names.\n\nTools:\n",
    );
    for spec in registry.visible_specs(allow) {
        out.push_str(&format!(
            "- {}: {}\n  arguments: {}\n  example: {}\n",
            spec.name,
            spec.description,
            crate::tools::schema::to_json_schema(&spec.args),
            spec.example_args,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn config_in(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.workspace.root = dir.to_string_lossy().to_string();
        config.state.db_path = dir
            .join("state.db")
            .to_string_lossy()
            .to_string();
        config
    }

    #[tokio::test]
    async fn test_orchestrator_builds_from_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(config_in(dir.path()), None, None).await;
        assert!(orchestrator.is_ok());
    }

    #[tokio::test]
    async fn test_empty_chain_turn_is_reason_coded() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(config_in(dir.path()), None, None)
            .await
            .unwrap();
        // No providers configured: even the intent fallback cannot run, and
        // the turn must fail with a specific code, not a crash.
        let report = orchestrator.handle_request("hello!").await.unwrap();
        assert!(matches!(
            report.stop,
            StopReason::Completed | StopReason::ProviderUnavailable
        ));
    }

    #[tokio::test]
    async fn test_exec_tool_names_include_run_command() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(config_in(dir.path()), None, None)
            .await
            .unwrap();
        let names = orchestrator.exec_tool_names();
        assert!(names.contains("run_command"));
        assert!(!names.contains("read_file"));
    }

    #[tokio::test]
    async fn test_system_prompt_narrowed_by_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(config_in(dir.path()), None, None)
            .await
            .unwrap();
        let run = orchestrator.build_run(&orchestrator.workspace, None).unwrap();
        let allow: HashSet<String> = ["read_file".to_string()].into_iter().collect();
        let prompt = system_prompt(&run.registry, Some(&allow));
        assert!(prompt.contains("read_file"));
        assert!(!prompt.contains("write_file"));
    }
}
