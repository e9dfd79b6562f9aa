use async_trait::async_trait;
use serde_json::json;

use crate::{
    ContentPart, FinishReason, Message, ModelProvider, Request, Response, Role, ToolCall,
    ToolDefinition, Usage,
};
use bsj_types::BsjError;

const PROVIDER: &str = "google";

// ---------------------------------------------------------------------------
// GeminiAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GeminiAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

impl GeminiAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            default_model: "gemini-2.5-flash".to_string(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = model;
        self
    }

    pub fn from_env() -> Result<Self, BsjError> {
        let key = std::env::var("GOOGLE_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map_err(|_| {
                BsjError::ConfigurationError(
                    "GOOGLE_API_KEY (or GEMINI_API_KEY) is not set".into(),
                )
            })?;
        Ok(Self::new(key))
    }

    fn build_request_body(&self, request: &Request) -> serde_json::Value {
        let system_texts: Vec<String> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::text)
            .collect();

        let contents: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(convert_message)
            .collect();

        let mut body = json!({
            "contents": contents,
        });

        if !system_texts.is_empty() {
            let parts: Vec<serde_json::Value> = system_texts
                .iter()
                .map(|t| json!({ "text": t }))
                .collect();
            body["systemInstruction"] = json!({ "parts": parts });
        }

        if !request.tools.is_empty() {
            let declarations: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(convert_tool_definition)
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        let mut gen_config = json!({});
        if let Some(max_tokens) = request.max_tokens {
            gen_config["maxOutputTokens"] = json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            gen_config["temperature"] = json!(temp);
        }
        // JSON mode is rejected by the API when function declarations are present.
        if request.json_output && request.tools.is_empty() {
            gen_config["responseMimeType"] = json!("application/json");
        }
        if gen_config.as_object().is_some_and(|o| !o.is_empty()) {
            body["generationConfig"] = gen_config;
        }

        body
    }

    /// A body without candidates (e.g. a blocked prompt) yields an empty
    /// response rather than an error; the stage adapter reports it as
    /// `EmptyResponse`.
    fn parse_response(&self, json: serde_json::Value) -> Response {
        let candidate = json["candidates"]
            .as_array()
            .and_then(|c| c.first())
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let finish_reason = match candidate["finishReason"].as_str() {
            Some("STOP") => FinishReason::EndTurn,
            Some("MAX_TOKENS") => FinishReason::MaxTokens,
            Some("SAFETY") | Some("PROHIBITED_CONTENT") => FinishReason::Safety,
            _ if json["promptFeedback"]["blockReason"].is_string() => FinishReason::Safety,
            _ => FinishReason::Other,
        };

        let mut text_parts: Vec<String> = Vec::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str() {
                    text_parts.push(text.to_string());
                }
                if let Some(fc) = part.get("functionCall") {
                    tool_calls.push(ToolCall {
                        id: uuid::Uuid::new_v4().to_string(),
                        name: fc["name"].as_str().unwrap_or_default().to_string(),
                        arguments: fc["args"].clone(),
                    });
                }
            }
        }

        let usage_meta = &json["usageMetadata"];
        let input_tokens = usage_meta["promptTokenCount"].as_u64().unwrap_or(0);
        let output_tokens = usage_meta["candidatesTokenCount"].as_u64().unwrap_or(0);
        let usage = Usage {
            input_tokens,
            output_tokens,
            total_tokens: usage_meta["totalTokenCount"]
                .as_u64()
                .unwrap_or(input_tokens + output_tokens),
        };

        let finish_reason = if tool_calls.is_empty() {
            finish_reason
        } else {
            FinishReason::ToolUse
        };

        Response {
            id: uuid::Uuid::new_v4().to_string(),
            text: text_parts.join(""),
            tool_calls,
            usage,
            model: String::new(),
            finish_reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Message conversion helpers
// ---------------------------------------------------------------------------

fn convert_message(msg: &Message) -> serde_json::Value {
    let role = match msg.role {
        Role::Assistant => "model",
        Role::User | Role::Tool | Role::System => "user",
    };

    let parts: Vec<serde_json::Value> = msg
        .content
        .iter()
        .map(|p| match p {
            ContentPart::Text { text } => json!({ "text": text }),
            ContentPart::ToolCall {
                name, arguments, ..
            } => json!({
                "functionCall": {
                    "name": name,
                    "args": arguments
                }
            }),
            ContentPart::ToolResult {
                name,
                content,
                is_error,
                ..
            } => json!({
                "functionResponse": {
                    "name": name,
                    "response": {
                        "content": content,
                        "is_error": is_error
                    }
                }
            }),
        })
        .collect();

    json!({
        "role": role,
        "parts": parts
    })
}

fn convert_tool_definition(tool: &ToolDefinition) -> serde_json::Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters
    })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(status: reqwest::StatusCode, body: &str) -> BsjError {
    let message = match status.as_u16() {
        401 | 403 => format!("authentication failed: {}", extract_error_message(body)),
        429 => format!("rate limited: {}", extract_error_message(body)),
        _ => extract_error_message(body),
    };
    BsjError::ProviderUnavailable {
        provider: PROVIDER.into(),
        status: Some(status.as_u16()),
        message,
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

fn transport_error(e: reqwest::Error) -> BsjError {
    BsjError::ProviderUnavailable {
        provider: PROVIDER.into(),
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// ModelProvider implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ModelProvider for GeminiAdapter {
    async fn complete(&self, request: &Request) -> bsj_types::Result<Response> {
        let body = self.build_request_body(request);
        let model = if request.model.is_empty() {
            &self.default_model
        } else {
            &request.model
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );

        tracing::debug!(model = %model, tools = request.tools.len(), "Gemini request");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let response_body = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(map_error(status, &response_body));
        }

        let json: serde_json::Value = serde_json::from_str(&response_body).map_err(|e| {
            BsjError::ProviderUnavailable {
                provider: PROVIDER.into(),
                status: Some(status.as_u16()),
                message: format!("failed to parse response JSON: {e}"),
            }
        })?;

        let mut response = self.parse_response(json);
        response.model = model.to_string();
        Ok(response)
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new("test-key".into())
    }

    fn basic_request() -> Request {
        Request {
            model: "gemini-2.5-flash".into(),
            messages: vec![Message::system("You are the researcher."), Message::user("Topic: fintech")],
            max_tokens: Some(1024),
            ..Default::default()
        }
    }

    // Test 1: system messages become systemInstruction
    #[test]
    fn system_instruction_extracted() {
        let body = adapter().build_request_body(&basic_request());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You are the researcher.");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
    }

    // Test 2: JSON mode only without tools
    #[test]
    fn json_mode_dropped_when_tools_attached() {
        let mut request = basic_request();
        request.json_output = true;
        let body = adapter().build_request_body(&request);
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");

        request.tools.push(ToolDefinition {
            name: "web_search".into(),
            description: "Search the web".into(),
            parameters: json!({"type": "object"}),
        });
        let body = adapter().build_request_body(&request);
        assert!(body["generationConfig"].get("responseMimeType").is_none());
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "web_search");
    }

    // Test 3: tool round trip is encoded with function names
    #[test]
    fn tool_turns_encoded() {
        let call = ToolCall {
            id: "c1".into(),
            name: "fetch_url".into(),
            arguments: json!({"url": "https://example.com"}),
        };
        let mut request = basic_request();
        request.messages.push(Message::assistant_tool_calls(std::slice::from_ref(&call)));
        request.messages.push(Message::tool_result(&call, "page text", false));
        let body = adapter().build_request_body(&request);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "fetch_url");
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["name"], "fetch_url");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["content"],
            "page text"
        );
    }

    // Test 4: text and usage parsed
    #[test]
    fn parse_text_response() {
        let resp = adapter().parse_response(json!({
            "candidates": [{
                "content": {"parts": [{"text": "{\"topics\": "}, {"text": "[]}"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5}
        }));
        assert_eq!(resp.text, "{\"topics\": []}");
        assert_eq!(resp.finish_reason, FinishReason::EndTurn);
        assert_eq!(resp.usage.total_tokens, 15);
    }

    // Test 5: function calls parsed
    #[test]
    fn parse_function_call() {
        let resp = adapter().parse_response(json!({
            "candidates": [{
                "content": {"parts": [{"functionCall": {"name": "web_search", "args": {"query": "mpesa"}}}]},
                "finishReason": "STOP"
            }]
        }));
        assert_eq!(resp.finish_reason, FinishReason::ToolUse);
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments["query"], "mpesa");
    }

    // Test 6: blocked prompt is an empty response, not an error
    #[test]
    fn blocked_prompt_is_empty() {
        let resp = adapter().parse_response(json!({
            "promptFeedback": {"blockReason": "SAFETY"}
        }));
        assert!(resp.is_empty());
        assert_eq!(resp.finish_reason, FinishReason::Safety);
    }

    // Test 7: HTTP errors map to ProviderUnavailable
    #[test]
    fn auth_error_maps_to_provider_unavailable() {
        let err = map_error(
            reqwest::StatusCode::UNAUTHORIZED,
            r#"{"error": {"message": "API key not valid"}}"#,
        );
        match err {
            BsjError::ProviderUnavailable {
                provider,
                status,
                message,
            } => {
                assert_eq!(provider, "google");
                assert_eq!(status, Some(401));
                assert!(message.contains("API key not valid"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(map_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "down").is_fatal());
    }

    // Test 8: unreachable endpoint is a provider failure
    #[tokio::test]
    async fn unreachable_endpoint() {
        let adapter = adapter().with_base_url("http://127.0.0.1:9".into());
        let err = adapter.complete(&basic_request()).await.unwrap_err();
        assert!(matches!(err, BsjError::ProviderUnavailable { status: None, .. }));
    }
}
