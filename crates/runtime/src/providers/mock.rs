//! Offline provider for running without credentials.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::model::{Message, ModelClient, ModelError, ModelRequest, ModelResponse, Usage};

/// Answers every request with a deterministic JSON echo of its input.
///
/// Tools are never requested, so every leaf finishes in one round.
#[derive(Debug, Default, Clone)]
pub struct MockModel;

impl MockModel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModelClient for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let input = request
            .messages
            .last()
            .map(Message::text)
            .unwrap_or_default();
        let chars = input.chars().count();
        let preview: String = input.chars().take(120).collect();

        let body: Value = json!({
            "agent": request.agent,
            "mock": true,
            "input_chars": chars,
            "preview": preview,
        });
        Ok(ModelResponse {
            message: Message::assistant(body.to_string()),
            usage: Usage {
                input_tokens: chars.div_ceil(4) as u32,
                output_tokens: 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_deterministically() {
        let request = ModelRequest {
            agent: "classifier".into(),
            model: None,
            instruction: "Classify.".into(),
            messages: vec![Message::user("Analyze sample.pdf")],
            tools: Vec::new(),
        };
        let first = MockModel.generate(request.clone()).await.unwrap();
        let second = MockModel.generate(request).await.unwrap();
        assert_eq!(first, second);

        let body: Value = serde_json::from_str(&first.message.text()).unwrap();
        assert_eq!(body["agent"], "classifier");
        assert_eq!(body["input_chars"], 18);
        assert!(first.message.tool_calls().is_empty());
    }
}
