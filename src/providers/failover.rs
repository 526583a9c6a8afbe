//! Provider failover chain.
//!
//! Wraps an ordered list of model providers. Each call walks the chain:
//! retryable errors get sequential exponential backoff against the same
//! provider (never concurrent fan-out), non-retryable errors skip straight to
//! the next provider, and exhausting the chain surfaces a reason-coded
//! failure for the whole call. Health and token usage are tracked per
//! provider.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::traits::{ChatMessage, ModelProvider, ProviderResponse};

use super::error::{ProviderError, ProviderErrorKind};

/// One provider in the chain, with its model name and retry budget.
pub struct ProviderEntry {
    pub provider: Arc<dyn ModelProvider>,
    pub model: String,
    pub max_retries: u32,
}

/// Emitted whenever the chain moves past a provider.
#[derive(Debug, Clone)]
pub struct FailoverEvent {
    pub from: String,
    pub to: Option<String>,
    pub reason: String,
}

/// A successful call plus where it landed and how it got there.
#[derive(Debug)]
pub struct ChatOutcome {
    pub response: ProviderResponse,
    pub provider: String,
    pub failovers: Vec<FailoverEvent>,
}

/// Every provider failed. Carries the last classified error per provider so
/// the caller can surface a specific, reason-coded message.
#[derive(Debug)]
pub struct ChainExhausted {
    pub attempts: Vec<(String, ProviderError)>,
}

impl ChainExhausted {
    pub fn user_message(&self) -> String {
        match self.attempts.last() {
            Some((name, err)) => format!(
                "All model providers failed ({} tried). Last: {} — {}",
                self.attempts.len(),
                name,
                err.user_message()
            ),
            None => "No model providers are configured.".to_string(),
        }
    }
}

impl fmt::Display for ChainExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for ChainExhausted {}

#[derive(Debug, Clone, Default)]
pub struct UsageTotals {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
struct HealthState {
    consecutive_failures: u32,
    last_error: Option<ProviderErrorKind>,
}

/// Health snapshot row for observers.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub name: String,
    pub consecutive_failures: u32,
    pub last_error: Option<ProviderErrorKind>,
}

pub struct FailoverChain {
    entries: Vec<ProviderEntry>,
    health: RwLock<Vec<HealthState>>,
    usage: Mutex<UsageTotals>,
    backoff_base: Duration,
    /// Consecutive failures after which a provider is skipped while any
    /// healthier alternative remains.
    unhealthy_threshold: u32,
}

impl FailoverChain {
    pub fn new(entries: Vec<ProviderEntry>, backoff_base: Duration) -> Self {
        let health = entries
            .iter()
            .map(|_| HealthState {
                consecutive_failures: 0,
                last_error: None,
            })
            .collect();
        Self {
            entries,
            health: RwLock::new(health),
            usage: Mutex::new(UsageTotals::default()),
            backoff_base,
            unhealthy_threshold: 3,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One chat call through the chain.
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatOutcome, ChainExhausted> {
        let mut attempts: Vec<(String, ProviderError)> = Vec::new();
        let mut failovers: Vec<FailoverEvent> = Vec::new();

        let skip_unhealthy = !self.all_unhealthy().await;

        for (idx, entry) in self.entries.iter().enumerate() {
            let name = entry.provider.name().to_string();

            if skip_unhealthy && self.is_unhealthy(idx).await {
                failovers.push(FailoverEvent {
                    from: name.clone(),
                    to: self.entries.get(idx + 1).map(|e| e.provider.name().to_string()),
                    reason: "skipped: marked unhealthy".to_string(),
                });
                continue;
            }

            match self.call_with_retries(idx, entry, messages).await {
                Ok(response) => {
                    self.mark_success(idx).await;
                    self.record_usage(&response).await;
                    return Ok(ChatOutcome {
                        response,
                        provider: name,
                        failovers,
                    });
                }
                Err(err) => {
                    self.mark_failure(idx, err.kind).await;
                    warn!(provider = %name, error = %err, "provider failed; moving down the chain");
                    failovers.push(FailoverEvent {
                        from: name.clone(),
                        to: self.entries.get(idx + 1).map(|e| e.provider.name().to_string()),
                        reason: format!("{:?}", err.kind),
                    });
                    attempts.push((name, err));
                }
            }
        }

        Err(ChainExhausted { attempts })
    }

    /// Sequential retries against one provider with exponential backoff.
    /// Non-retryable errors abort immediately so the chain can move on.
    async fn call_with_retries(
        &self,
        _idx: usize,
        entry: &ProviderEntry,
        messages: &[ChatMessage],
    ) -> Result<ProviderResponse, ProviderError> {
        let mut last_err: Option<ProviderError> = None;

        for attempt in 0..=entry.max_retries {
            match entry.provider.chat(&entry.model, messages).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if !err.is_retryable() || attempt == entry.max_retries {
                        return Err(err);
                    }
                    let wait = match err.retry_after_secs {
                        Some(secs) => Duration::from_secs(secs),
                        None => self.backoff_base * 2u32.saturating_pow(attempt),
                    };
                    info!(
                        provider = entry.provider.name(),
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "retryable provider error; backing off"
                    );
                    tokio::time::sleep(wait).await;
                    last_err = Some(err);
                }
            }
        }

        // Loop always returns; this satisfies the compiler on the 0-retry path.
        Err(last_err.unwrap_or_else(|| ProviderError::empty_response(entry.provider.name())))
    }

    async fn is_unhealthy(&self, idx: usize) -> bool {
        let health = self.health.read().await;
        health
            .get(idx)
            .map(|h| h.consecutive_failures >= self.unhealthy_threshold)
            .unwrap_or(false)
    }

    async fn all_unhealthy(&self) -> bool {
        let health = self.health.read().await;
        !health.is_empty()
            && health
                .iter()
                .all(|h| h.consecutive_failures >= self.unhealthy_threshold)
    }

    async fn mark_success(&self, idx: usize) {
        let mut health = self.health.write().await;
        if let Some(h) = health.get_mut(idx) {
            h.consecutive_failures = 0;
            h.last_error = None;
        }
    }

    async fn mark_failure(&self, idx: usize, kind: ProviderErrorKind) {
        let mut health = self.health.write().await;
        if let Some(h) = health.get_mut(idx) {
            h.consecutive_failures += 1;
            h.last_error = Some(kind);
        }
    }

    async fn record_usage(&self, response: &ProviderResponse) {
        let mut usage = self.usage.lock().await;
        usage.calls += 1;
        if let Some(u) = &response.usage {
            usage.input_tokens += u.input_tokens as u64;
            usage.output_tokens += u.output_tokens as u64;
        }
    }

    pub async fn usage(&self) -> UsageTotals {
        self.usage.lock().await.clone()
    }

    pub async fn health_snapshot(&self) -> Vec<ProviderHealth> {
        let health = self.health.read().await;
        self.entries
            .iter()
            .zip(health.iter())
            .map(|(entry, h)| ProviderHealth {
                name: entry.provider.name().to_string(),
                consecutive_failures: h.consecutive_failures,
                last_error: h.last_error,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TokenUsage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted provider: fails `fail_count` times with `kind`, then succeeds.
    struct ScriptedProvider {
        name: String,
        fail_count: u32,
        kind: ProviderErrorKind,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(name: &str, fail_count: u32, kind: ProviderErrorKind) -> Self {
            Self {
                name: name.to_string(),
                fail_count,
                kind,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn chat(
            &self,
            model: &str,
            _messages: &[ChatMessage],
        ) -> Result<ProviderResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_count {
                return Err(ProviderError {
                    kind: self.kind,
                    status: None,
                    message: "scripted failure".to_string(),
                    retry_after_secs: None,
                });
            }
            Ok(ProviderResponse {
                content: format!("reply from {}", self.name),
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    model: model.to_string(),
                }),
            })
        }
    }

    fn entry(provider: Arc<dyn ModelProvider>, max_retries: u32) -> ProviderEntry {
        ProviderEntry {
            provider,
            model: "test-model".to_string(),
            max_retries,
        }
    }

    fn chain(entries: Vec<ProviderEntry>) -> FailoverChain {
        FailoverChain::new(entries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_primary_success_no_failover() {
        let c = chain(vec![entry(
            Arc::new(ScriptedProvider::new("p1", 0, ProviderErrorKind::Timeout)),
            1,
        )]);
        let outcome = c.chat(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(outcome.provider, "p1");
        assert!(outcome.failovers.is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_success_same_provider() {
        let c = chain(vec![entry(
            Arc::new(ScriptedProvider::new("p1", 1, ProviderErrorKind::Timeout)),
            2,
        )]);
        let outcome = c.chat(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(outcome.provider, "p1");
        assert!(outcome.failovers.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_failover_to_second_provider() {
        // p1 times out twice with a retry budget of 1 -> fails over to p2.
        let c = chain(vec![
            entry(
                Arc::new(ScriptedProvider::new("p1", 5, ProviderErrorKind::Timeout)),
                1,
            ),
            entry(
                Arc::new(ScriptedProvider::new("p2", 0, ProviderErrorKind::Timeout)),
                1,
            ),
        ]);
        let outcome = c.chat(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(outcome.provider, "p2");
        assert_eq!(outcome.failovers.len(), 1);
        assert_eq!(outcome.failovers[0].from, "p1");
        assert_eq!(outcome.failovers[0].to.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_non_retryable_skips_retries() {
        let p1 = Arc::new(ScriptedProvider::new("p1", 5, ProviderErrorKind::Auth));
        let c = chain(vec![
            ProviderEntry {
                provider: p1.clone(),
                model: "m".to_string(),
                max_retries: 3,
            },
            entry(
                Arc::new(ScriptedProvider::new("p2", 0, ProviderErrorKind::Timeout)),
                0,
            ),
        ]);
        let outcome = c.chat(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(outcome.provider, "p2");
        // Auth error must not be retried against p1.
        assert_eq!(p1.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chain_exhaustion_carries_attempts() {
        let c = chain(vec![
            entry(
                Arc::new(ScriptedProvider::new("p1", 99, ProviderErrorKind::ServerError)),
                0,
            ),
            entry(
                Arc::new(ScriptedProvider::new("p2", 99, ProviderErrorKind::Network)),
                0,
            ),
        ]);
        let err = c.chat(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert_eq!(err.attempts.len(), 2);
        assert!(err.user_message().contains("p2"));
    }

    #[tokio::test]
    async fn test_usage_accounting() {
        let c = chain(vec![entry(
            Arc::new(ScriptedProvider::new("p1", 0, ProviderErrorKind::Timeout)),
            0,
        )]);
        c.chat(&[ChatMessage::user("hi")]).await.unwrap();
        c.chat(&[ChatMessage::user("again")]).await.unwrap();
        let usage = c.usage().await;
        assert_eq!(usage.calls, 2);
        assert_eq!(usage.input_tokens, 20);
        assert_eq!(usage.output_tokens, 10);
    }

    #[tokio::test]
    async fn test_unhealthy_provider_skipped_until_reset() {
        let p1 = Arc::new(ScriptedProvider::new("p1", 99, ProviderErrorKind::ServerError));
        let c = chain(vec![
            ProviderEntry {
                provider: p1.clone(),
                model: "m".to_string(),
                max_retries: 0,
            },
            entry(
                Arc::new(ScriptedProvider::new("p2", 0, ProviderErrorKind::Timeout)),
                0,
            ),
        ]);
        // Three failing calls push p1 over the unhealthy threshold.
        for _ in 0..3 {
            c.chat(&[ChatMessage::user("hi")]).await.unwrap();
        }
        let before = p1.calls.load(Ordering::SeqCst);
        c.chat(&[ChatMessage::user("hi")]).await.unwrap();
        // p1 was skipped this time.
        assert_eq!(p1.calls.load(Ordering::SeqCst), before);
        let health = c.health_snapshot().await;
        assert!(health[0].consecutive_failures >= 3);
    }

    #[tokio::test]
    async fn test_empty_chain_is_exhausted() {
        let c = chain(vec![]);
        let err = c.chat(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(err.attempts.is_empty());
        assert!(err.user_message().contains("No model providers"));
    }
}
