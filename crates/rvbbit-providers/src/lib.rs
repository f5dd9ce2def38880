//! # RVBBIT Providers
//!
//! Provider-agnostic LLM invocation. The engine talks to one trait,
//! [`ChatModel`]; concrete providers speak the chat-completions HTTP shape.
//!
//! Providers with native function calling return structured
//! [`ToolCall`](rvbbit_core::ToolCall)s; providers configured in prompt mode
//! (`supports_native_tools() == false`) never see tool schemas on the wire —
//! the agent loop embeds them in the prompt and parses fenced JSON out of the
//! response instead.

mod mock;
mod openai_compat;

pub use mock::MockChatModel;
pub use openai_compat::OpenAiCompatModel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rvbbit_core::{Message, Result, ToolCall};

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other,
}

/// Token usage (and cost, when the provider's pricing is known).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost = match (self.cost, other.cost) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

/// One chat-completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Tool schemas (`{name, description, parameters}`); ignored by
    /// prompt-mode providers.
    pub tools: Vec<serde_json::Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = tools;
        self
    }
}

/// One chat-completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish: FinishReason,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            finish: FinishReason::Stop,
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self.finish = FinishReason::ToolCalls;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// A chat-completion provider.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier sent to the provider.
    fn model(&self) -> &str;

    /// Whether the provider accepts structured tool schemas. When false the
    /// agent loop runs in prompt mode.
    fn supports_native_tools(&self) -> bool {
        true
    }

    async fn generate(&self, request: ChatRequest) -> Result<ChatResponse>;
}
