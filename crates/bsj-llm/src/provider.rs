use async_trait::async_trait;

use crate::{Request, Response};

// ---------------------------------------------------------------------------
// ModelProvider
// ---------------------------------------------------------------------------

/// An external model backend.
///
/// Implementations map every transport and authentication failure to
/// [`bsj_types::BsjError::ProviderUnavailable`] and never retry on their own;
/// retry policy belongs to the orchestrator.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, request: &Request) -> bsj_types::Result<Response>;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FinishReason, Message, Usage};
    use std::sync::Arc;

    struct EchoProvider;

    #[async_trait]
    impl ModelProvider for EchoProvider {
        async fn complete(&self, request: &Request) -> bsj_types::Result<Response> {
            let text = request
                .messages
                .last()
                .map(|m| m.text())
                .unwrap_or_default();
            Ok(Response {
                id: "echo".into(),
                text,
                tool_calls: vec![],
                usage: Usage::default(),
                model: self.default_model().into(),
                finish_reason: FinishReason::EndTurn,
            })
        }

        fn name(&self) -> &str {
            "echo"
        }

        fn default_model(&self) -> &str {
            "echo-1"
        }
    }

    #[tokio::test]
    async fn provider_is_object_safe() {
        let provider: Arc<dyn ModelProvider> = Arc::new(EchoProvider);
        let request = Request {
            messages: vec![Message::user("ping")],
            ..Default::default()
        };
        let response = provider.complete(&request).await.unwrap();
        assert_eq!(response.text, "ping");
        assert_eq!(response.model, "echo-1");
        assert_eq!(provider.name(), "echo");
    }
}
