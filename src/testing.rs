//! Shared test doubles for planner/executor/orchestrator tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::providers::{FailoverChain, ProviderEntry, ProviderError, ProviderErrorKind};
use crate::traits::{ChatMessage, ModelProvider, ProviderResponse, TokenUsage};

/// Scripted provider: returns queued replies in order. An exhausted queue
/// yields an EmptyResponse error so runaway loops fail loudly in tests.
pub struct ScriptedChat {
    name: String,
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedChat {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            name: "scripted".to_string(),
            replies: Mutex::new(replies.into_iter().map(str::to_string).collect()),
        }
    }

    #[allow(dead_code)]
    pub async fn remaining(&self) -> usize {
        self.replies.lock().await.len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedChat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        model: &str,
        _messages: &[ChatMessage],
    ) -> Result<ProviderResponse, ProviderError> {
        let mut replies = self.replies.lock().await;
        match replies.pop_front() {
            Some(content) => Ok(ProviderResponse {
                content,
                usage: Some(TokenUsage {
                    input_tokens: 20,
                    output_tokens: 10,
                    model: model.to_string(),
                }),
            }),
            None => Err(ProviderError {
                kind: ProviderErrorKind::EmptyResponse,
                status: None,
                message: "scripted replies exhausted".to_string(),
                retry_after_secs: None,
            }),
        }
    }
}

/// A single-provider failover chain over scripted replies.
pub fn scripted_chain(replies: Vec<&str>) -> FailoverChain {
    FailoverChain::new(
        vec![ProviderEntry {
            provider: Arc::new(ScriptedChat::new(replies)),
            model: "test-model".to_string(),
            max_retries: 0,
        }],
        Duration::from_millis(1),
    )
}
