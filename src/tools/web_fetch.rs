use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::traits::Tool;
use crate::utils::truncate_with_note;

use super::schema::{ArgSpec, ArgType, ValidatedArgs};
use super::{SideEffect, ToolSpec};

const MAX_BODY_CHARS: usize = 20_000;

/// Fetch a URL and return the response body as text.
pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_fetch".to_string(),
            description: "Fetch a http(s) URL and return the body as text.".to_string(),
            args: vec![ArgSpec::required("url", ArgType::String, "URL to fetch")],
            example_args: json!({"url": "https://example.com/readme"}),
            side_effects: vec![SideEffect::Network],
            visible_to_model: true,
            callable: true,
        }
    }

    async fn call(&self, args: &ValidatedArgs) -> anyhow::Result<Value> {
        let url = args
            .str("url")
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: url"))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("only http(s) URLs are supported: {url}");
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("fetch failed: {e}"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("failed to read body: {e}"))?;

        Ok(json!({
            "url": url,
            "status": status.as_u16(),
            "body": truncate_with_note(&body, MAX_BODY_CHARS),
        }))
    }
}
