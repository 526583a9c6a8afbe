//! Audit/trace event stream.
//!
//! Every state transition, tool call, tool result, policy decision and
//! approval event is emitted as an immutable structured record
//! `{trace_id, step_sequence, event_name, data}`. The stream is the only
//! channel external observers should rely on for replaying a turn: it feeds
//! the sqlite store for durability and an optional live observer channel.

mod payloads;
mod store;

pub use payloads::*;
pub use store::EventStore;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::warn;

/// A single immutable event in a turn's trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Database id; 0 until persisted.
    pub id: i64,
    pub trace_id: String,
    /// Monotonic within the trace.
    pub step_sequence: i64,
    pub event_type: EventType,
    pub data: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // === Turn lifecycle ===
    TurnStarted,
    StateTransition,
    TurnCompleted,

    // === Routing & planning ===
    IntentClassified,
    PlanGenerated,
    PlanParseFailed,
    ReplanTriggered,

    // === Approval gate ===
    ApprovalRequested,
    ApprovalResolved,

    // === Tool lifecycle ===
    ToolCall,
    ToolResult,
    PolicyDenial,

    // === Step lifecycle ===
    StepStarted,
    StepCompleted,
    StepFailed,

    // === Verification & sandbox ===
    VerificationPassed,
    VerificationFailed,
    SandboxMerged,
    SandboxDiscarded,

    // === Providers ===
    ProviderFailover,
    TokenUsage,

    // === Context management ===
    ContextCompacted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TurnStarted => "turn_started",
            EventType::StateTransition => "state_transition",
            EventType::TurnCompleted => "turn_completed",
            EventType::IntentClassified => "intent_classified",
            EventType::PlanGenerated => "plan_generated",
            EventType::PlanParseFailed => "plan_parse_failed",
            EventType::ReplanTriggered => "replan_triggered",
            EventType::ApprovalRequested => "approval_requested",
            EventType::ApprovalResolved => "approval_resolved",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::PolicyDenial => "policy_denial",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::VerificationPassed => "verification_passed",
            EventType::VerificationFailed => "verification_failed",
            EventType::SandboxMerged => "sandbox_merged",
            EventType::SandboxDiscarded => "sandbox_discarded",
            EventType::ProviderFailover => "provider_failover",
            EventType::TokenUsage => "token_usage",
            EventType::ContextCompacted => "context_compacted",
        }
    }
}

/// Emits events for one turn. Cheap to clone; the sequence counter is
/// shared so cloned emitters keep ordering monotonic.
#[derive(Clone)]
pub struct EventEmitter {
    trace_id: String,
    seq: Arc<AtomicI64>,
    store: Option<Arc<EventStore>>,
    observer: Option<mpsc::UnboundedSender<TraceEvent>>,
}

impl EventEmitter {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            seq: Arc::new(AtomicI64::new(0)),
            store: None,
            observer: None,
        }
    }

    pub fn with_store(mut self, store: Arc<EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<TraceEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Emit one event. Persistence failures are logged, never fatal — an
    /// audit hiccup must not kill the turn.
    pub async fn emit(&self, event_type: EventType, data: JsonValue) {
        let event = TraceEvent {
            id: 0,
            trace_id: self.trace_id.clone(),
            step_sequence: self.seq.fetch_add(1, Ordering::SeqCst),
            event_type,
            data,
            created_at: Utc::now(),
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.insert(&event).await {
                warn!(error = %e, event = event_type.as_str(), "failed to persist event");
            }
        }
        if let Some(observer) = &self.observer {
            let _ = observer.send(event);
        }
    }

    /// Serialize a typed payload and emit it.
    pub async fn emit_payload<T: Serialize>(&self, event_type: EventType, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(data) => self.emit(event_type, data).await,
            Err(e) => warn!(error = %e, "failed to serialize event payload"),
        }
    }
}
