//! Model provider clients and the failover layer that wraps them.

mod error;
mod failover;
mod openai_compatible;

use std::time::Duration;

pub use error::{ProviderError, ProviderErrorKind};
pub use failover::{
    ChainExhausted, ChatOutcome, FailoverChain, FailoverEvent, ProviderEntry, ProviderHealth,
    UsageTotals,
};
pub use openai_compatible::OpenAiCompatibleProvider;

use reqwest::Client;

/// Shared HTTP client builder with the per-request timeout applied.
pub(crate) fn build_http_client(timeout: Duration) -> Result<Client, String> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| format!("failed to build HTTP client: {e}"))
}
