//! Tool registry and dispatch.
//!
//! Capabilities are registered once at startup into an immutable table keyed
//! by name. Dispatch runs a fixed gate sequence — name lookup, callability,
//! policy allow/deny, argument validation, command safety, confirmation —
//! before a handler ever executes. The validation gate is the primary defense
//! against malformed model output reaching real file or process mutation.

pub mod command_risk;
pub mod fs_utils;
pub mod path_tracker;
pub mod schema;
pub mod undo;

mod read_file;
mod run_command;
mod search_files;
mod web_fetch;
mod write_file;

pub use path_tracker::PathTracker;
pub use read_file::ReadFileTool;
pub use run_command::RunCommandTool;
pub use search_files::SearchFilesTool;
pub use undo::{UndoLog, UndoOutcome};
pub use web_fetch::WebFetchTool;
pub use write_file::WriteFileTool;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::policy::RiskLevel;
use crate::traits::Tool;
use crate::utils::truncate_with_note;
use schema::{ArgSpec, FieldError, ValidatedArgs};

/// Side effects a tool may have, declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    Read,
    Write,
    Exec,
    Network,
}

/// Immutable registry entry describing one callable capability.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub args: Vec<ArgSpec>,
    /// Example arguments shown to the model in the tool catalog.
    pub example_args: Value,
    pub side_effects: Vec<SideEffect>,
    /// Whether the tool appears in the catalog sent to the model.
    pub visible_to_model: bool,
    /// Whether the model may invoke it. Invisible-but-callable supports
    /// internal tools; visible-but-not-callable supports documentation stubs.
    pub callable: bool,
}

impl ToolSpec {
    pub fn has_side_effect(&self, effect: SideEffect) -> bool {
        self.side_effects.contains(&effect)
    }

    /// Write or Exec — the effects that trigger confirmation and verification.
    pub fn is_mutating(&self) -> bool {
        self.has_side_effect(SideEffect::Write) || self.has_side_effect(SideEffect::Exec)
    }
}

/// Machine-readable dispatch error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_NO_TOOL")]
    NoTool,
    #[serde(rename = "E_INVALID_ARGS")]
    InvalidArgs,
    #[serde(rename = "E_DENIED")]
    Denied,
    #[serde(rename = "E_TOOL")]
    ToolFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoTool => "E_NO_TOOL",
            ErrorCode::InvalidArgs => "E_INVALID_ARGS",
            ErrorCode::Denied => "E_DENIED",
            ErrorCode::ToolFailed => "E_TOOL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Outcome of one dispatch. `ok=false` always carries a machine-readable
/// code; payload and error are mutually exclusive by convention (a handler
/// may attach partial payload on a recoverable error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn success(payload: Value) -> Self {
        Self {
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some(ToolError {
                code,
                message: message.into(),
                details: None,
            }),
        }
    }

    pub fn failure_with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some(ToolError {
                code,
                message: message.into(),
                details: Some(details),
            }),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    pub fn is_denied(&self) -> bool {
        self.error_code() == Some(ErrorCode::Denied)
    }

    /// Render the result as text for the model's context window.
    pub fn render_for_model(&self, max_chars: usize) -> String {
        if self.ok {
            let body = match &self.payload {
                Some(Value::String(s)) => s.clone(),
                Some(other) => {
                    serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
                }
                None => "ok".to_string(),
            };
            truncate_with_note(&body, max_chars)
        } else {
            let err = self.error.as_ref();
            let code = err.map(|e| e.code.as_str()).unwrap_or("E_TOOL");
            let message = err.map(|e| e.message.as_str()).unwrap_or("unknown error");
            let mut out = format!("error {code}: {message}");
            if let Some(details) = err.and_then(|e| e.details.as_ref()) {
                out.push('\n');
                out.push_str(&truncate_with_note(&details.to_string(), 600));
            }
            out
        }
    }
}

/// A pending Write/Exec confirmation. The dispatcher blocks on `reply`;
/// dropping the sender counts as a denial, never as consent.
#[derive(Debug)]
pub struct ConfirmationRequest {
    pub tool: String,
    pub summary: String,
    pub risk: RiskLevel,
    pub reply: oneshot::Sender<bool>,
}

pub type ConfirmSender = mpsc::Sender<ConfirmationRequest>;

/// Process-wide tool table, built once at startup and immutable after.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let name = tool.spec().name;
        if self.tools.contains_key(&name) {
            anyhow::bail!("duplicate tool registration: {name}");
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn spec(&self, name: &str) -> Option<ToolSpec> {
        self.tools.get(name).map(|t| t.spec())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Specs for the model-facing tool catalog, optionally narrowed to an
    /// intent allow-list.
    pub fn visible_specs(&self, allow: Option<&HashSet<String>>) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| t.spec())
            .filter(|s| s.visible_to_model)
            .filter(|s| allow.map(|a| a.contains(&s.name)).unwrap_or(true))
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

/// Dispatch-time policy: global allow/deny plus the Write/Exec confirmation
/// channel. The intent-scoped allow-list arrives per call.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    global_allow: Option<HashSet<String>>,
    global_deny: HashSet<String>,
    confirm: Option<ConfirmSender>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        global_allow: Option<Vec<String>>,
        global_deny: Vec<String>,
        confirm: Option<ConfirmSender>,
    ) -> Self {
        Self {
            registry,
            global_allow: global_allow.map(|v| v.into_iter().collect()),
            global_deny: global_deny.into_iter().collect(),
            confirm,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Dispatch one tool call. `turn_allow` is the intent-scoped allow-list
    /// for the current turn; calls outside it are rejected, not dropped.
    pub async fn dispatch(
        &self,
        name: &str,
        raw_args: &Value,
        turn_allow: Option<&HashSet<String>>,
    ) -> ToolResult {
        let tool = match self.registry.get(name) {
            Some(tool) => tool.clone(),
            None => {
                return ToolResult::failure(ErrorCode::NoTool, format!("unknown tool: {name}"));
            }
        };
        let spec = tool.spec();

        if !spec.callable {
            return ToolResult::failure(
                ErrorCode::NoTool,
                format!("tool {name} is not callable by the model"),
            );
        }

        if let Some(denial) = self.policy_denial(&spec, turn_allow) {
            return denial;
        }

        let args = match schema::validate(&spec.args, raw_args) {
            Ok(args) => args,
            Err(errors) => return invalid_args_result(name, &errors),
        };

        // Exec side effects are screened by the command-safety evaluator
        // independent of the confirmation step.
        if spec.has_side_effect(SideEffect::Exec) {
            if let Some(command) = args.str("command") {
                let assessment = command_risk::classify_command(command);
                if assessment.level == RiskLevel::Critical {
                    return ToolResult::failure_with_details(
                        ErrorCode::Denied,
                        format!("command denied by safety policy: {command}"),
                        serde_json::json!({ "warnings": assessment.warnings }),
                    );
                }
            }
        }

        if spec.is_mutating() {
            let risk = self.mutation_risk(&spec, &args);
            if !self.confirm_mutation(&spec, &args, risk).await {
                return ToolResult::failure(
                    ErrorCode::Denied,
                    format!("confirmation denied for {name}"),
                );
            }
        }

        self.invoke(tool, name, args).await
    }

    fn policy_denial(
        &self,
        spec: &ToolSpec,
        turn_allow: Option<&HashSet<String>>,
    ) -> Option<ToolResult> {
        if let Some(allow) = turn_allow {
            if !allow.contains(&spec.name) {
                return Some(ToolResult::failure(
                    ErrorCode::Denied,
                    format!("tool {} is outside the allowed set for this turn", spec.name),
                ));
            }
        }
        if let Some(allow) = &self.global_allow {
            if !allow.contains(&spec.name) {
                return Some(ToolResult::failure(
                    ErrorCode::Denied,
                    format!("tool {} is not on the global allow-list", spec.name),
                ));
            }
        }
        if self.global_deny.contains(&spec.name) {
            return Some(ToolResult::failure(
                ErrorCode::Denied,
                format!("tool {} is on the global deny-list", spec.name),
            ));
        }
        None
    }

    fn mutation_risk(&self, spec: &ToolSpec, args: &ValidatedArgs) -> RiskLevel {
        if spec.has_side_effect(SideEffect::Exec) {
            if let Some(command) = args.str("command") {
                return command_risk::classify_command(command).level;
            }
        }
        RiskLevel::Medium
    }

    /// Blocking human-confirmation point. With no confirmer wired the default
    /// degrades to deny — ambiguous input never proceeds.
    async fn confirm_mutation(
        &self,
        spec: &ToolSpec,
        args: &ValidatedArgs,
        risk: RiskLevel,
    ) -> bool {
        let Some(confirm) = &self.confirm else {
            warn!(tool = %spec.name, "no confirmer wired; denying mutating call");
            return false;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ConfirmationRequest {
            tool: spec.name.clone(),
            summary: mutation_summary(spec, args),
            risk,
            reply: reply_tx,
        };
        if confirm.send(request).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    async fn invoke(&self, tool: Arc<dyn Tool>, name: &str, args: ValidatedArgs) -> ToolResult {
        // Run the handler on its own task so a panic surfaces as E_TOOL
        // instead of tearing down the turn.
        let handle = tokio::spawn(async move { tool.call(&args).await });
        match handle.await {
            Ok(Ok(payload)) => ToolResult::success(payload),
            Ok(Err(err)) => {
                ToolResult::failure(ErrorCode::ToolFailed, format!("{name} failed: {err:#}"))
            }
            Err(join_err) => {
                warn!(tool = name, error = %join_err, "tool handler panicked");
                ToolResult::failure(ErrorCode::ToolFailed, format!("{name} panicked"))
            }
        }
    }
}

fn invalid_args_result(name: &str, errors: &[FieldError]) -> ToolResult {
    let reasons: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    ToolResult::failure_with_details(
        ErrorCode::InvalidArgs,
        format!("invalid arguments for {name}: {}", reasons.join("; ")),
        serde_json::json!({
            "fields": errors
                .iter()
                .map(|e| serde_json::json!({"field": e.field, "reason": e.reason}))
                .collect::<Vec<_>>()
        }),
    )
}

fn mutation_summary(spec: &ToolSpec, args: &ValidatedArgs) -> String {
    if let Some(command) = args.str("command") {
        return format!("{}: {}", spec.name, crate::utils::truncate_str(command, 120));
    }
    if let Some(path) = args.str("path") {
        return format!("{}: {}", spec.name, path);
    }
    spec.name.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use schema::ArgType;
    use serde_json::json;

    struct EchoTool {
        mutating: bool,
        callable: bool,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "Echo a message".to_string(),
                args: vec![
                    ArgSpec::required("message", ArgType::String, "Message to echo"),
                    ArgSpec::optional("repeat", ArgType::Integer, "Times to repeat")
                        .with_default(json!(1)),
                ],
                example_args: json!({"message": "hi"}),
                side_effects: if self.mutating {
                    vec![SideEffect::Write]
                } else {
                    vec![SideEffect::Read]
                },
                visible_to_model: true,
                callable: self.callable,
            }
        }

        async fn call(&self, args: &ValidatedArgs) -> anyhow::Result<Value> {
            let message = args
                .str("message")
                .ok_or_else(|| anyhow::anyhow!("message missing"))?;
            let repeat = args.i64("repeat").unwrap_or(1).max(1) as usize;
            Ok(json!(vec![message.to_string(); repeat].join(" ")))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "panic".to_string(),
                description: "Always panics".to_string(),
                args: vec![],
                example_args: json!({}),
                side_effects: vec![SideEffect::Read],
                visible_to_model: false,
                callable: true,
            }
        }

        async fn call(&self, _args: &ValidatedArgs) -> anyhow::Result<Value> {
            panic!("boom");
        }
    }

    fn dispatcher_with(tools: Vec<Arc<dyn Tool>>) -> Dispatcher {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        Dispatcher::new(Arc::new(registry), None, Vec::new(), None)
    }

    #[tokio::test]
    async fn test_unknown_tool_is_e_no_tool() {
        let d = dispatcher_with(vec![]);
        let result = d.dispatch("nope", &json!({}), None).await;
        assert!(!result.ok);
        assert_eq!(result.error_code(), Some(ErrorCode::NoTool));
    }

    #[tokio::test]
    async fn test_not_callable_is_e_no_tool() {
        let d = dispatcher_with(vec![Arc::new(EchoTool {
            mutating: false,
            callable: false,
        })]);
        let result = d.dispatch("echo", &json!({"message": "hi"}), None).await;
        assert_eq!(result.error_code(), Some(ErrorCode::NoTool));
    }

    #[tokio::test]
    async fn test_missing_required_arg_never_reaches_handler() {
        let d = dispatcher_with(vec![Arc::new(EchoTool {
            mutating: false,
            callable: true,
        })]);
        let result = d.dispatch("echo", &json!({}), None).await;
        assert_eq!(result.error_code(), Some(ErrorCode::InvalidArgs));
        let details = result.error.unwrap().details.unwrap();
        assert_eq!(details["fields"][0]["field"], "message");
    }

    #[tokio::test]
    async fn test_unknown_field_is_invalid_args() {
        let d = dispatcher_with(vec![Arc::new(EchoTool {
            mutating: false,
            callable: true,
        })]);
        let result = d
            .dispatch("echo", &json!({"message": "hi", "x": 1}), None)
            .await;
        assert_eq!(result.error_code(), Some(ErrorCode::InvalidArgs));
    }

    #[tokio::test]
    async fn test_successful_dispatch_applies_defaults() {
        let d = dispatcher_with(vec![Arc::new(EchoTool {
            mutating: false,
            callable: true,
        })]);
        let result = d.dispatch("echo", &json!({"message": "hi"}), None).await;
        assert!(result.ok);
        assert_eq!(result.payload.unwrap(), json!("hi"));
    }

    #[tokio::test]
    async fn test_turn_allow_list_rejects_out_of_set_tool() {
        let d = dispatcher_with(vec![Arc::new(EchoTool {
            mutating: false,
            callable: true,
        })]);
        let allow: HashSet<String> = ["read_file".to_string()].into_iter().collect();
        let result = d
            .dispatch("echo", &json!({"message": "hi"}), Some(&allow))
            .await;
        assert_eq!(result.error_code(), Some(ErrorCode::Denied));
    }

    #[tokio::test]
    async fn test_global_deny_list() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(EchoTool {
                mutating: false,
                callable: true,
            }))
            .unwrap();
        let d = Dispatcher::new(
            Arc::new(registry),
            None,
            vec!["echo".to_string()],
            None,
        );
        let result = d.dispatch("echo", &json!({"message": "hi"}), None).await;
        assert_eq!(result.error_code(), Some(ErrorCode::Denied));
    }

    #[tokio::test]
    async fn test_mutating_tool_denied_without_confirmer() {
        let d = dispatcher_with(vec![Arc::new(EchoTool {
            mutating: true,
            callable: true,
        })]);
        let result = d.dispatch("echo", &json!({"message": "hi"}), None).await;
        assert_eq!(result.error_code(), Some(ErrorCode::Denied));
    }

    #[tokio::test]
    async fn test_mutating_tool_runs_when_confirmed() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(EchoTool {
                mutating: true,
                callable: true,
            }))
            .unwrap();
        let (tx, mut rx) = mpsc::channel::<ConfirmationRequest>(1);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.reply.send(true);
            }
        });
        let d = Dispatcher::new(Arc::new(registry), None, Vec::new(), Some(tx));
        let result = d.dispatch("echo", &json!({"message": "hi"}), None).await;
        assert!(result.ok);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_e_tool() {
        let d = dispatcher_with(vec![Arc::new(PanicTool)]);
        let result = d.dispatch("panic", &json!({}), None).await;
        assert_eq!(result.error_code(), Some(ErrorCode::ToolFailed));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(EchoTool {
                mutating: false,
                callable: true,
            }))
            .unwrap();
        let err = registry.register(Arc::new(EchoTool {
            mutating: false,
            callable: true,
        }));
        assert!(err.is_err());
    }

    #[test]
    fn test_render_for_model_error_shape() {
        let result = ToolResult::failure(ErrorCode::InvalidArgs, "bad args");
        let text = result.render_for_model(500);
        assert!(text.contains("E_INVALID_ARGS"));
        assert!(text.contains("bad args"));
    }
}
