use std::fmt;

/// Classified provider error — tells the failover layer *why* a model call
/// failed so it can pick the right recovery strategy.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Seconds to wait before retrying (from a 429 Retry-After header or body).
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403 — bad API key or permissions.
    Auth,
    /// 402 — billing/quota exhausted.
    Billing,
    /// 429 — rate limited; check retry_after_secs.
    RateLimit,
    /// 404 or "model not found" — bad model name.
    NotFound,
    /// 408 or the per-request timeout fired.
    Timeout,
    /// Connection refused, DNS failure, reset, etc.
    Network,
    /// 500/502/503/504 — provider-side outage.
    ServerError,
    /// The reply arrived but carried no usable content.
    EmptyResponse,
    /// Anything else.
    Unknown,
}

impl ProviderError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            402 => ProviderErrorKind::Billing,
            404 => ProviderErrorKind::NotFound,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            500 | 502 | 503 | 504 => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::Unknown,
        };

        let retry_after_secs = if kind == ProviderErrorKind::RateLimit {
            extract_retry_after(body)
        } else {
            None
        };

        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
            retry_after_secs,
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: err.to_string(),
            retry_after_secs: None,
        }
    }

    pub fn empty_response(provider: &str) -> Self {
        Self {
            kind: ProviderErrorKind::EmptyResponse,
            status: None,
            message: format!("{provider} returned a response with no content"),
            retry_after_secs: None,
        }
    }

    /// Whether this error is worth retrying against the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimit
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Network
                | ProviderErrorKind::ServerError
                | ProviderErrorKind::EmptyResponse
        )
    }

    /// User-facing summary; never a raw stack trace or response body dump.
    pub fn user_message(&self) -> String {
        match self.kind {
            ProviderErrorKind::Auth => {
                "Model provider rejected the API key. Check the configured credentials.".to_string()
            }
            ProviderErrorKind::Billing => {
                "Model provider reported a billing problem — the account quota may be exhausted."
                    .to_string()
            }
            ProviderErrorKind::RateLimit => match self.retry_after_secs {
                Some(secs) => format!("Rate limited by the model provider (retry in {secs}s)."),
                None => "Rate limited by the model provider.".to_string(),
            },
            ProviderErrorKind::NotFound => {
                "Configured model was not found on the provider.".to_string()
            }
            ProviderErrorKind::Timeout => "Model request timed out.".to_string(),
            ProviderErrorKind::Network => {
                "Cannot reach the model provider (network error).".to_string()
            }
            ProviderErrorKind::ServerError => {
                "Model provider is experiencing issues (server error).".to_string()
            }
            ProviderErrorKind::EmptyResponse => {
                "Model provider returned an empty response.".to_string()
            }
            ProviderErrorKind::Unknown => format!("Model provider error: {}", self.message),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "provider error ({}, {:?}): {}",
                status, self.kind, self.message
            ),
            None => write!(f, "provider error ({:?}): {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Parse retry_after from a JSON error body.
/// Handles {"error": {"retry_after": 5}} and {"retry_after": 5}, int or float.
fn extract_retry_after(body: &str) -> Option<u64> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v["error"]["retry_after"]
        .as_u64()
        .or_else(|| v["retry_after"].as_u64())
        .or_else(|| {
            v["error"]["retry_after"]
                .as_f64()
                .or_else(|| v["retry_after"].as_f64())
                .map(|f| f.ceil() as u64)
        })
}

fn truncate_body(body: &str) -> String {
    crate::utils::truncate_str(body, 300)
}
