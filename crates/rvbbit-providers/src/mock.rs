//! Scripted chat model for tests: returns queued responses in order and
//! records every request it receives.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use rvbbit_core::{Result, ToolCall};

use crate::{ChatModel, ChatRequest, ChatResponse, Usage};

/// Deterministic [`ChatModel`] used by engine and bridge tests.
pub struct MockChatModel {
    model: String,
    native_tools: bool,
    script: Mutex<VecDeque<Result<ChatResponse>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockChatModel {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            native_tools: true,
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Run in prompt mode (no native function calling).
    pub fn with_native_tools(mut self, native: bool) -> Self {
        self.native_tools = native;
        self
    }

    /// Queue a plain text turn.
    pub fn push_text(&self, content: impl Into<String>) -> &Self {
        self.script
            .lock()
            .push_back(Ok(ChatResponse::text(content).with_usage(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                cost: None,
            })));
        self
    }

    /// Queue a turn that requests tool calls.
    pub fn push_tool_calls(&self, calls: Vec<ToolCall>) -> &Self {
        self.script
            .lock()
            .push_back(Ok(ChatResponse::text("").with_tool_calls(calls).with_usage(
                Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    cost: None,
                },
            )));
        self
    }

    /// Queue a full response.
    pub fn push_response(&self, response: ChatResponse) -> &Self {
        self.script.lock().push_back(Ok(response));
        self
    }

    /// Queue an error turn.
    pub fn push_error(&self, error: rvbbit_core::Error) -> &Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Default for MockChatModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    fn model(&self) -> &str {
        &self.model
    }

    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }

    async fn generate(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(request);
        match self.script.lock().pop_front() {
            Some(result) => result,
            // An exhausted script answers with a terminal empty turn.
            None => Ok(ChatResponse::text("done")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvbbit_core::Message;

    #[tokio::test]
    async fn scripted_turns_in_order() {
        let mock = MockChatModel::new();
        mock.push_text("first");
        mock.push_tool_calls(vec![ToolCall::new("1", "echo", serde_json::json!({}))]);

        let r1 = mock
            .generate(ChatRequest::new(vec![Message::user("a")]))
            .await
            .unwrap();
        assert_eq!(r1.content, "first");

        let r2 = mock
            .generate(ChatRequest::new(vec![Message::user("b")]))
            .await
            .unwrap();
        assert_eq!(r2.tool_calls.len(), 1);

        let r3 = mock
            .generate(ChatRequest::new(vec![Message::user("c")]))
            .await
            .unwrap();
        assert_eq!(r3.content, "done");

        assert_eq!(mock.request_count(), 3);
    }
}
