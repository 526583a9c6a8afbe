//! Reference wire client for OpenAI-compatible chat-completion endpoints.
//!
//! Implements the model-call contract only: ordered messages in, text out,
//! with errors classified so the failover chain can pick a recovery strategy.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::traits::{ChatMessage, ModelProvider, ProviderResponse, TokenUsage};

use super::error::ProviderError;

pub struct OpenAiCompatibleProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, String> {
        Ok(Self {
            name: name.into(),
            client: super::build_http_client(timeout)?,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ProviderResponse, ProviderError> {
        let body = json!({
            "model": model,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
        });

        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::network(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::network(&e))?;

        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &text));
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|_| ProviderError {
            kind: super::ProviderErrorKind::Unknown,
            status: Some(status.as_u16()),
            message: "provider returned unparseable JSON".to_string(),
            retry_after_secs: None,
        })?;

        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if content.is_empty() {
            return Err(ProviderError::empty_response(&self.name));
        }

        let usage = parsed.get("usage").map(|u| TokenUsage {
            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
            model: model.to_string(),
        });

        Ok(ProviderResponse { content, usage })
    }
}
