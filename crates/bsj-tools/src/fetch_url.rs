use async_trait::async_trait;
use serde_json::json;

use crate::http;
use crate::tool::Tool;
use crate::truncation::{truncate_output, MAX_TOOL_OUTPUT_CHARS};
use bsj_llm::ToolDefinition;
use bsj_types::BsjError;

const NAME: &str = "fetch_url";

/// Full-page fetch through the Firecrawl scrape API, returned as Markdown.
pub struct FetchUrlTool {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl FetchUrlTool {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: "https://api.firecrawl.dev".to_string(),
            client: http::client(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    /// `None` when `FIRECRAWL_API_KEY` is not set.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("FIRECRAWL_API_KEY").ok()?;
        let tool = Self::new(key);
        Some(match std::env::var("FIRECRAWL_BASE_URL") {
            Ok(url) => tool.with_base_url(url),
            Err(_) => tool,
        })
    }
}

fn extract_markdown(body: &serde_json::Value) -> Option<String> {
    let data = &body["data"];
    let markdown = data["markdown"].as_str().filter(|m| !m.trim().is_empty())?;
    match data["metadata"]["title"].as_str() {
        Some(title) => Some(format!("# {title}\n\n{markdown}")),
        None => Some(markdown.to_string()),
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: NAME.to_string(),
            description: "Fetch the full content of a web page as Markdown.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["url"],
                "properties": {
                    "url": { "type": "string", "description": "Absolute http(s) URL" }
                }
            }),
        }
    }

    async fn probe(&self) -> bsj_types::Result<()> {
        http::probe(&self.client, NAME, &self.base_url).await
    }

    async fn execute(&self, arguments: serde_json::Value) -> bsj_types::Result<String> {
        let url = http::required_str(&arguments, "url", NAME)?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(BsjError::ToolError {
                tool: NAME.into(),
                message: format!("not an http(s) URL: {url}"),
            });
        }

        tracing::debug!(tool = NAME, url = %url, "Fetching");
        let resp = self
            .client
            .post(format!("{}/v1/scrape", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "url": url,
                "formats": ["markdown"],
                "onlyMainContent": true
            }))
            .send()
            .await
            .map_err(|e| http::unreachable(NAME, e))?;
        let resp = http::check_status(NAME, resp).await?;
        let body: serde_json::Value = resp.json().await.map_err(|e| BsjError::ToolError {
            tool: NAME.into(),
            message: format!("invalid scrape response: {e}"),
        })?;

        let markdown = extract_markdown(&body).ok_or_else(|| BsjError::ToolError {
            tool: NAME.into(),
            message: format!("no content extracted from {url}"),
        })?;
        Ok(truncate_output(&markdown, MAX_TOOL_OUTPUT_CHARS))
    }
}
