use async_trait::async_trait;
use serde_json::json;

use crate::http;
use crate::tool::Tool;
use crate::truncation::{truncate_output, MAX_TOOL_OUTPUT_CHARS};
use bsj_llm::ToolDefinition;
use bsj_types::BsjError;

const NAME: &str = "web_search";

/// Web search through the Tavily REST API.
pub struct WebSearchTool {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: "https://api.tavily.com".to_string(),
            client: http::client(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    /// `None` when `TAVILY_API_KEY` is not set.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("TAVILY_API_KEY").ok()?;
        let tool = Self::new(key);
        Some(match std::env::var("TAVILY_BASE_URL") {
            Ok(url) => tool.with_base_url(url),
            Err(_) => tool,
        })
    }
}

fn format_results(body: &serde_json::Value) -> String {
    let mut out = Vec::new();
    if let Some(answer) = body["answer"].as_str().filter(|a| !a.is_empty()) {
        out.push(format!("Answer: {answer}\n"));
    }
    for (i, result) in body["results"].as_array().into_iter().flatten().enumerate() {
        out.push(format!(
            "[{}] {}\n{}\n{}\n",
            i + 1,
            result["title"].as_str().unwrap_or("(untitled)"),
            result["url"].as_str().unwrap_or_default(),
            result["content"].as_str().unwrap_or_default(),
        ));
    }
    if out.is_empty() {
        "No results.".to_string()
    } else {
        out.join("\n")
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: NAME.to_string(),
            description: "Search the web for recent sources on a topic. Returns titles, URLs and snippets."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["query"],
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "max_results": {
                        "type": "integer",
                        "description": "Maximum number of results",
                        "default": 5
                    }
                }
            }),
        }
    }

    async fn probe(&self) -> bsj_types::Result<()> {
        http::probe(&self.client, NAME, &self.base_url).await
    }

    async fn execute(&self, arguments: serde_json::Value) -> bsj_types::Result<String> {
        let query = http::required_str(&arguments, "query", NAME)?;
        let max_results = arguments
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(5)
            .clamp(1, 20);

        tracing::debug!(tool = NAME, query = %query, "Searching");
        let resp = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&json!({
                "api_key": self.api_key,
                "query": query,
                "max_results": max_results,
                "search_depth": "basic",
                "include_answer": true
            }))
            .send()
            .await
            .map_err(|e| http::unreachable(NAME, e))?;
        let resp = http::check_status(NAME, resp).await?;
        let body: serde_json::Value = resp.json().await.map_err(|e| BsjError::ToolError {
            tool: NAME.into(),
            message: format!("invalid search response: {e}"),
        })?;
        Ok(truncate_output(&format_results(&body), MAX_TOOL_OUTPUT_CHARS))
    }
}
