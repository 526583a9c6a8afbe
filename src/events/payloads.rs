//! Typed payloads for the trace event stream.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Data for TurnStarted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStartedData {
    pub user_text: String,
}

/// Data for StateTransition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransitionData {
    pub from: String,
    pub to: String,
}

/// Data for IntentClassified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentClassifiedData {
    pub intent: String,
    pub category: String,
    pub confidence: f32,
    pub risk: String,
    pub planning_required: bool,
}

/// Data for PlanGenerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanGeneratedData {
    pub plan_id: String,
    pub title: String,
    pub step_count: usize,
}

/// Data for ReplanTriggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanTriggeredData {
    pub failed_step: String,
    pub replans_used: usize,
    pub new_plan_id: Option<String>,
}

/// Data for ApprovalRequested / ApprovalResolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEventData {
    pub request_id: String,
    pub risk: String,
    pub status: String,
}

/// Data for ToolCall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallData {
    pub name: String,
    pub arguments: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Data for ToolResult.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultData {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Data for PolicyDenial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDenialData {
    pub tool: String,
    pub reason: String,
}

/// Data for StepStarted / StepCompleted / StepFailed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEventData {
    pub step_id: String,
    pub description: String,
}

/// Data for VerificationPassed / VerificationFailed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationEventData {
    pub checked_files: usize,
    pub failure_count: usize,
}

/// Data for ProviderFailover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFailoverData {
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub reason: String,
}

/// Data for TokenUsage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageData {
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Data for TurnCompleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCompletedData {
    pub stop_reason: String,
    pub answer_chars: usize,
}

/// Data for SandboxMerged / SandboxDiscarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEventData {
    pub touched_files: usize,
    pub reason: String,
}
