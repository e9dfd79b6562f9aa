//! Agent Stage Adapter: one model invocation per attempt.
//!
//! The adapter turns a stage descriptor plus its state view into a provider
//! request, runs a bounded tool loop, and hands back the raw text together
//! with [`AttemptMetadata`]. It never retries and never touches session state.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::capability::StageCapabilities;
use crate::stage::{AgentSpec, StageDescriptor};
use crate::validator::RawOutput;
use bsj_llm::{Message, ModelProvider, Request, Response};
use bsj_tools::truncation::{truncate_output, MAX_TOOL_OUTPUT_CHARS};
use bsj_types::{AttemptMetadata, AttemptOutcome, BsjError, Result, StateView};

/// Per-attempt inputs chosen by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    /// 1-based.
    pub attempt: usize,
    /// Diagnostics and reviewer notes to append to the prompt.
    pub guidance: &'a [String],
    pub capabilities: &'a StageCapabilities,
}

/// Result of one invocation. The metadata is always present, even when the
/// invocation failed.
#[derive(Debug)]
pub struct StageAttempt {
    pub output: Result<RawOutput>,
    pub metadata: AttemptMetadata,
}

pub struct AgentStageAdapter {
    provider: Arc<dyn ModelProvider>,
    default_model: Option<String>,
    max_tool_rounds: usize,
}

impl AgentStageAdapter {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            default_model: None,
            max_tool_rounds: 6,
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.default_model = (!model.is_empty()).then_some(model);
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    fn model_for(&self, spec: &AgentSpec) -> String {
        spec.model
            .clone()
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    pub async fn run(
        &self,
        stage: &StageDescriptor,
        view: &StateView,
        ctx: &AttemptContext<'_>,
    ) -> StageAttempt {
        let started = Instant::now();
        let Some(spec) = stage.agent_spec() else {
            return StageAttempt {
                output: Err(BsjError::InvariantViolation(format!(
                    "stage '{}' is not an agent stage",
                    stage.name
                ))),
                metadata: AttemptMetadata::new(&stage.name, ctx.attempt, ""),
            };
        };

        let mut metadata = AttemptMetadata::new(&stage.name, ctx.attempt, self.model_for(spec));
        if !ctx.capabilities.degraded.is_empty() {
            metadata.tool_fallback = true;
            metadata.degraded_tools = ctx.capabilities.degraded.clone();
        }

        tracing::info!(
            stage = %stage.name,
            attempt = ctx.attempt,
            model = %metadata.model,
            tools = ctx.capabilities.tools.len(),
            "Invoking agent stage"
        );
        let output = self.invoke(stage, spec, view, ctx, &mut metadata).await;
        metadata.duration_ms = started.elapsed().as_millis() as u64;
        match &output {
            Err(BsjError::EmptyResponse { .. }) => {
                metadata.finish(AttemptOutcome::Empty, Some("response was empty".into()))
            }
            Err(BsjError::Cancelled) => metadata.finish(AttemptOutcome::Cancelled, None),
            Err(e) => metadata.finish(AttemptOutcome::ProviderError, Some(e.to_string())),
            Ok(_) => {}
        }
        StageAttempt { output, metadata }
    }

    async fn invoke(
        &self,
        stage: &StageDescriptor,
        spec: &AgentSpec,
        view: &StateView,
        ctx: &AttemptContext<'_>,
        metadata: &mut AttemptMetadata,
    ) -> Result<RawOutput> {
        let wants_json = spec.schema.as_ref().is_some_and(|s| !s.is_text());
        let base = Request {
            model: metadata.model.clone(),
            messages: vec![
                Message::system(system_prompt(spec)),
                Message::user(user_prompt(view, ctx.guidance)),
            ],
            temperature: spec.temperature,
            json_output: wants_json,
            ..Default::default()
        };

        if ctx.capabilities.tools.is_empty() {
            let response = self.provider.complete(&base).await?;
            return finish(stage, response);
        }

        let definitions: Vec<_> = ctx
            .capabilities
            .tools
            .iter()
            .map(|t| t.definition())
            .collect();
        let mut messages = base.messages.clone();

        for round in 0..=self.max_tool_rounds {
            let final_round = round == self.max_tool_rounds;
            let request = Request {
                messages: messages.clone(),
                tools: if final_round {
                    Vec::new()
                } else {
                    definitions.clone()
                },
                ..base.clone()
            };
            let response = self.provider.complete(&request).await?;
            if response.tool_calls.is_empty() || final_round {
                return finish(stage, response);
            }

            messages.push(Message::assistant_tool_calls(&response.tool_calls));
            for call in &response.tool_calls {
                metadata.tool_calls += 1;
                let Some(tool) = ctx.capabilities.find(&call.name) else {
                    messages.push(Message::tool_result(
                        call,
                        format!("unknown tool '{}'", call.name),
                        true,
                    ));
                    continue;
                };
                tracing::debug!(stage = %stage.name, tool = %call.name, "Tool call");
                match tool.execute(call.arguments.clone()).await {
                    Ok(output) => messages.push(Message::tool_result(
                        call,
                        truncate_output(&output, MAX_TOOL_OUTPUT_CHARS),
                        false,
                    )),
                    Err(BsjError::ToolUnavailable { tool, message }) => {
                        tracing::warn!(
                            stage = %stage.name,
                            tool = %tool,
                            error = %message,
                            "Tool unavailable, falling back to model-only invocation"
                        );
                        metadata.tool_fallback = true;
                        if !metadata.degraded_tools.contains(&tool) {
                            metadata.degraded_tools.push(tool);
                        }
                        let response = self.provider.complete(&base).await?;
                        return finish(stage, response);
                    }
                    Err(e) => messages.push(Message::tool_result(call, e.to_string(), true)),
                }
            }
        }
        // The final round above never attaches tools, so the loop always returns.
        Err(BsjError::InvariantViolation(format!(
            "tool loop for stage '{}' ended without a response",
            stage.name
        )))
    }
}

fn finish(stage: &StageDescriptor, response: Response) -> Result<RawOutput> {
    if response.text.trim().is_empty() {
        return Err(BsjError::EmptyResponse {
            stage: stage.name.clone(),
        });
    }
    Ok(RawOutput::Text(response.text))
}

fn system_prompt(spec: &AgentSpec) -> String {
    let mut prompt = spec.instruction.trim().to_string();
    if let Some(schema) = spec.schema.as_ref().filter(|s| !s.is_text()) {
        let shape = serde_json::to_string_pretty(&schema.shape.describe())
            .unwrap_or_else(|_| schema.shape.describe().to_string());
        prompt.push_str("\n\nRespond with JSON only, no prose, matching this shape:\n");
        prompt.push_str(&shape);
        if let Some(envelope) = &schema.envelope {
            prompt.push_str(&format!(
                "\nYou may wrap it as {{\"{envelope}\": ...}}. Keys ending in '?' are optional."
            ));
        }
    }
    prompt
}

fn user_prompt(view: &StateView, guidance: &[String]) -> String {
    let state: serde_json::Map<String, Value> =
        view.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let state = serde_json::to_string_pretty(&Value::Object(state)).unwrap_or_default();
    let mut prompt = format!("Session state:\n```json\n{state}\n```");
    if !guidance.is_empty() {
        prompt.push_str("\n\nAddress the following before answering:");
        for note in guidance {
            prompt.push_str("\n- ");
            prompt.push_str(note);
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, OutputSchema, Shape};
    use async_trait::async_trait;
    use bsj_llm::{FinishReason, ToolCall, ToolDefinition, Usage};
    use bsj_tools::Tool;
    use serde_json::json;
    use std::sync::Mutex;

    fn text_response(text: &str) -> Response {
        Response {
            id: "r".into(),
            text: text.into(),
            tool_calls: vec![],
            usage: Usage::default(),
            model: "mock".into(),
            finish_reason: FinishReason::EndTurn,
        }
    }

    fn tool_response(name: &str) -> Response {
        Response {
            tool_calls: vec![ToolCall {
                id: "call-1".into(),
                name: name.into(),
                arguments: json!({"url": "https://example.com"}),
            }],
            finish_reason: FinishReason::ToolUse,
            ..text_response("")
        }
    }

    /// Returns queued responses and records every request.
    struct QueueProvider {
        replies: Mutex<Vec<Result<Response>>>,
        requests: Mutex<Vec<Request>>,
    }

    impl QueueProvider {
        fn new(mut replies: Vec<Result<Response>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelProvider for QueueProvider {
        async fn complete(&self, request: &Request) -> Result<Response> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(text_response("{}")))
        }
        fn name(&self) -> &str {
            "queue"
        }
        fn default_model(&self) -> &str {
            "mock-default"
        }
    }

    struct FetchTool {
        up: bool,
    }

    #[async_trait]
    impl Tool for FetchTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "fetch_url".into(),
                description: "fetch".into(),
                parameters: json!({"type": "object"}),
            }
        }
        async fn execute(&self, _arguments: Value) -> Result<String> {
            if self.up {
                Ok("# Page\n\nMobile money adoption doubled.".into())
            } else {
                Err(BsjError::ToolUnavailable {
                    tool: "fetch_url".into(),
                    message: "connection refused".into(),
                })
            }
        }
    }

    fn researcher() -> StageDescriptor {
        StageDescriptor::agent("researcher", "You are the researcher.")
            .reads(["topic"])
            .writes(["research"])
            .schema(
                OutputSchema::new(Shape::object(vec![FieldSpec::required(
                    "topics",
                    Shape::list_of(Shape::text(), 1),
                )]))
                .with_envelope("research"),
            )
            .optional_tool("fetch_url")
    }

    fn view() -> StateView {
        std::collections::BTreeMap::from([("topic".to_string(), json!("AI in African fintech"))])
            .into()
    }

    #[tokio::test]
    async fn prompt_carries_view_schema_and_guidance() {
        let provider = QueueProvider::new(vec![Ok(text_response(r#"{"topics": ["x"]}"#))]);
        let adapter = AgentStageAdapter::new(provider.clone());
        let caps = StageCapabilities::default();
        let guidance = vec!["need more sources".to_string()];
        let ctx = AttemptContext {
            attempt: 2,
            guidance: &guidance,
            capabilities: &caps,
        };

        let attempt = adapter.run(&researcher(), &view(), &ctx).await;
        assert!(matches!(attempt.output, Ok(RawOutput::Text(_))));
        assert_eq!(attempt.metadata.attempt, 2);
        assert_eq!(attempt.metadata.model, "mock-default");
        assert!(!attempt.metadata.tool_fallback);

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        let system = requests[0].messages[0].text();
        let user = requests[0].messages[1].text();
        assert!(system.contains("Respond with JSON only"));
        assert!(system.contains("topics"));
        assert!(user.contains("AI in African fintech"));
        assert!(user.contains("- need more sources"));
        assert!(requests[0].json_output);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back() {
        let provider = QueueProvider::new(vec![
            Ok(tool_response("fetch_url")),
            Ok(text_response(r#"{"topics": ["mobile money"]}"#)),
        ]);
        let adapter = AgentStageAdapter::new(provider.clone());
        let caps = StageCapabilities {
            tools: vec![Arc::new(FetchTool { up: true })],
            degraded: vec![],
        };
        let ctx = AttemptContext {
            attempt: 1,
            guidance: &[],
            capabilities: &caps,
        };

        let attempt = adapter.run(&researcher(), &view(), &ctx).await;
        assert!(attempt.output.is_ok());
        assert_eq!(attempt.metadata.tool_calls, 1);
        assert!(!attempt.metadata.tool_fallback);

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        let last = requests[1].messages.last().unwrap();
        assert_eq!(last.role, bsj_llm::Role::Tool);
    }

    #[tokio::test]
    async fn unavailable_tool_falls_back_once() {
        let provider = QueueProvider::new(vec![
            Ok(tool_response("fetch_url")),
            Ok(text_response(r#"{"topics": ["mobile money"]}"#)),
        ]);
        let adapter = AgentStageAdapter::new(provider.clone());
        let caps = StageCapabilities {
            tools: vec![Arc::new(FetchTool { up: false })],
            degraded: vec![],
        };
        let ctx = AttemptContext {
            attempt: 1,
            guidance: &[],
            capabilities: &caps,
        };

        let attempt = adapter.run(&researcher(), &view(), &ctx).await;
        assert!(attempt.output.is_ok());
        assert!(attempt.metadata.tool_fallback);
        assert_eq!(attempt.metadata.degraded_tools, vec!["fetch_url".to_string()]);

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].tools.is_empty());
        assert_eq!(requests[1].messages.len(), 2);
    }

    #[tokio::test]
    async fn degraded_capability_is_flagged() {
        let provider = QueueProvider::new(vec![Ok(text_response(r#"{"topics": ["x"]}"#))]);
        let adapter = AgentStageAdapter::new(provider.clone());
        let caps = StageCapabilities {
            tools: vec![],
            degraded: vec!["fetch_url".into()],
        };
        let ctx = AttemptContext {
            attempt: 1,
            guidance: &[],
            capabilities: &caps,
        };
        let attempt = adapter.run(&researcher(), &view(), &ctx).await;
        assert!(attempt.metadata.tool_fallback);
        assert!(provider.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn tool_loop_is_bounded() {
        let provider = QueueProvider::new(vec![
            Ok(tool_response("fetch_url")),
            Ok(tool_response("fetch_url")),
            Ok(text_response(r#"{"topics": ["x"]}"#)),
        ]);
        let adapter = AgentStageAdapter::new(provider.clone()).with_max_tool_rounds(2);
        let caps = StageCapabilities {
            tools: vec![Arc::new(FetchTool { up: true })],
            degraded: vec![],
        };
        let ctx = AttemptContext {
            attempt: 1,
            guidance: &[],
            capabilities: &caps,
        };
        let attempt = adapter.run(&researcher(), &view(), &ctx).await;
        assert!(attempt.output.is_ok());
        let requests = provider.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[2].tools.is_empty());
    }

    #[tokio::test]
    async fn empty_and_provider_errors_surface() {
        let provider = QueueProvider::new(vec![
            Ok(text_response("  ")),
            Err(BsjError::ProviderUnavailable {
                provider: "queue".into(),
                status: Some(401),
                message: "bad key".into(),
            }),
        ]);
        let adapter = AgentStageAdapter::new(provider).with_default_model("gemini-2.5-flash");
        let caps = StageCapabilities::default();
        let ctx = AttemptContext {
            attempt: 1,
            guidance: &[],
            capabilities: &caps,
        };

        let first = adapter.run(&researcher(), &view(), &ctx).await;
        assert!(matches!(first.output, Err(BsjError::EmptyResponse { .. })));
        assert_eq!(first.metadata.outcome, Some(AttemptOutcome::Empty));
        assert_eq!(first.metadata.model, "gemini-2.5-flash");

        let second = adapter.run(&researcher(), &view(), &ctx).await;
        assert!(matches!(second.output, Err(BsjError::ProviderUnavailable { .. })));
        assert_eq!(second.metadata.outcome, Some(AttemptOutcome::ProviderError));
    }
}
