//! Queue-driven provider for tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{
    Message, ModelClient, ModelError, ModelRequest, ModelResponse, Part, Role, ToolCall, Usage,
};

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Result<Message, ModelError>>,
    requests: Vec<ModelRequest>,
}

/// Answers requests from a queue of canned replies, in order, and records
/// every request it receives. Runs out with [`ModelError::InvalidResponse`].
#[derive(Debug, Default)]
pub struct ScriptedModel {
    script: Mutex<Script>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.lock().replies.push_back(Ok(Message::assistant(text)));
        self
    }

    /// Queue a reply whose text is the JSON rendering of `value`.
    pub fn push_json(&self, value: Value) -> &Self {
        self.push_text(value.to_string())
    }

    pub fn push_tool_call(&self, name: impl Into<String>, input: Value) -> &Self {
        let mut script = self.lock();
        let id = format!("call_{}", script.replies.len() + script.requests.len() + 1);
        script.replies.push_back(Ok(Message {
            role: Role::Assistant,
            parts: vec![Part::ToolCall(ToolCall {
                id,
                name: name.into(),
                input,
            })],
        }));
        drop(script);
        self
    }

    pub fn push_error(&self, error: ModelError) -> &Self {
        self.lock().replies.push_back(Err(error));
        self
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock().requests.clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock().replies.len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let mut script = self.lock();
        script.requests.push(request);
        let reply = script
            .replies
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::InvalidResponse("script exhausted".into())))?;
        Ok(ModelResponse {
            message: reply,
            usage: Usage::default(),
        })
    }
}
