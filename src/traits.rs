//! Capability contracts consumed by the orchestration core.
//!
//! Tools and model providers are external collaborators: they plug in behind
//! these narrow traits and communicate only through the returned values. No
//! side channel back into the state machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::ProviderError;
use crate::tools::schema::ValidatedArgs;
use crate::tools::ToolSpec;

/// One message in the ordered conversation sent to a model provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Token usage reported by a provider for a single call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
}

/// The model's reply to a chat call.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// Model-call capability — implemented by provider wire clients, consumed
/// through the failover chain. Errors are classified so the failover layer
/// can distinguish a timeout from a generic failure.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider name used in health tracking and failover events.
    fn name(&self) -> &str;

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Tool capability — one registered, immutable entry per callable capability.
///
/// The dispatcher validates and coerces arguments against `spec().args`
/// before `call` runs; a handler never sees missing required fields, unknown
/// fields, or out-of-enum values. Handler errors become `E_TOOL` results.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn call(&self, args: &ValidatedArgs) -> anyhow::Result<Value>;
}
