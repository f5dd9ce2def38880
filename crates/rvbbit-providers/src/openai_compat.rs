//! Chat-completions HTTP client.
//!
//! Works against any endpoint speaking the OpenAI-style
//! `/v1/chat/completions` shape (hosted providers, local gateways, llama.cpp
//! servers). Transient failures (HTTP 429/5xx, transport errors) retry with
//! exponential backoff and jitter; other 4xx responses surface the full body
//! as a permanent provider error.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use rvbbit_core::env_vars;
use rvbbit_core::{Error, Message, Result, Role, ToolCall};

use crate::{ChatModel, ChatRequest, ChatResponse, FinishReason, Usage};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Approximate USD pricing per 1M tokens (prompt, completion) by model
/// prefix. Unknown models report no cost.
const PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4.1", 2.00, 8.00),
    ("o3", 2.00, 8.00),
];

/// OpenAI-compatible chat model.
#[derive(Debug, Clone)]
pub struct OpenAiCompatModel {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    prompt_mode: bool,
    max_retries: u32,
}

impl OpenAiCompatModel {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: env_vars::env_string_or_default(env_vars::API_BASE, DEFAULT_API_BASE),
            api_key: env_vars::env_string(env_vars::API_KEY),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            prompt_mode: false,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// The default model from `RVBBIT_MODEL`, or a small hosted default.
    pub fn from_env() -> Self {
        Self::new(env_vars::env_string_or_default(
            env_vars::MODEL,
            DEFAULT_MODEL,
        ))
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Disable native function calling; the agent loop falls back to
    /// fenced-JSON tool parsing.
    pub fn with_prompt_mode(mut self, prompt_mode: bool) -> Self {
        self.prompt_mode = prompt_mode;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    fn build_body(&self, request: &ChatRequest) -> WireRequest {
        let tools = if self.prompt_mode || request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| WireTool {
                        kind: "function".to_string(),
                        function: t.clone(),
                    })
                    .collect(),
            )
        };
        WireRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(to_wire_message).collect(),
            tools,
            temperature: request.temperature.or(self.temperature),
            max_tokens: request.max_tokens.or(self.max_tokens),
        }
    }

    fn cost_for(&self, usage: &WireUsage) -> Option<f64> {
        PRICING
            .iter()
            .find(|(prefix, _, _)| self.model.starts_with(prefix))
            .map(|(_, input, output)| {
                (usage.prompt_tokens as f64 * input + usage.completion_tokens as f64 * output)
                    / 1_000_000.0
            })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatModel {
    fn model(&self) -> &str {
        &self.model
    }

    fn supports_native_tools(&self) -> bool {
        !self.prompt_mode
    }

    async fn generate(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(&request);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let backoff = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    tracing::warn!(
                        attempt,
                        error = %e,
                        "transient provider error, retrying after {:?}",
                        backoff + jitter
                    );
                    tokio::time::sleep(backoff + jitter).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl OpenAiCompatModel {
    async fn send_once(&self, body: &WireRequest) -> Result<ChatResponse> {
        let mut req = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| Error::ProviderTransient {
            status: 0,
            message: format!("transport error: {e}"),
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::ProviderTransient {
                status: status.as_u16(),
                message,
            });
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ProviderPermanent {
                status: status.as_u16(),
                body,
            });
        }

        let wire: WireResponse = response.json().await.map_err(|e| Error::ProviderPermanent {
            status: status.as_u16(),
            body: format!("unparseable provider response: {e}"),
        })?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::ProviderPermanent {
                status: status.as_u16(),
                body: "provider returned no choices".to_string(),
            })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let args = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::String(tc.function.arguments.clone()));
                ToolCall::new(tc.id, tc.function.name, args)
            })
            .collect::<Vec<_>>();

        let finish = match choice.finish_reason.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some("length") => FinishReason::Length,
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Other,
        };

        let usage = wire.usage.unwrap_or_default();
        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                cost: self.cost_for(&usage),
            },
            finish,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn to_wire_message(message: &Message) -> WireMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|tc| WireToolCall {
                    id: tc.id.clone(),
                    kind: "function".to_string(),
                    function: WireFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.args.to_string(),
                    },
                })
                .collect(),
        )
    };
    WireMessage {
        role: role.to_string(),
        content: message.content.clone(),
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion_body(content: &str) -> serde_json::Value {
        json!({
            "choices": [{
                "message": { "content": content },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 5 }
        })
    }

    #[tokio::test]
    async fn basic_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hello")))
            .mount(&server)
            .await;

        let model = OpenAiCompatModel::new("gpt-4o-mini").with_api_base(server.uri());
        let response = model
            .generate(ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap();

        assert_eq!(response.content, "hello");
        assert_eq!(response.finish, FinishReason::Stop);
        assert_eq!(response.usage.prompt_tokens, 12);
        assert!(response.usage.cost.is_some());
    }

    #[tokio::test]
    async fn parses_native_tool_calls() {
        let server = MockServer::start().await;
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "shell", "arguments": "{\"command\":\"ls\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 30, "completion_tokens": 8 }
        });
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let model = OpenAiCompatModel::new("gpt-4o-mini").with_api_base(server.uri());
        let response = model
            .generate(ChatRequest::new(vec![Message::user("list files")]))
            .await
            .unwrap();

        assert_eq!(response.finish, FinishReason::ToolCalls);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "shell");
        assert_eq!(response.tool_calls[0].args["command"], "ls");
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream busy"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("recovered")))
            .mount(&server)
            .await;

        let model = OpenAiCompatModel::new("gpt-4o-mini")
            .with_api_base(server.uri())
            .with_max_retries(3);
        let response = model
            .generate(ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap();
        assert_eq!(response.content, "recovered");
    }

    #[tokio::test]
    async fn permanent_error_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string("{\"error\": {\"message\": \"bad messages\"}}"),
            )
            .mount(&server)
            .await;

        let model = OpenAiCompatModel::new("gpt-4o-mini").with_api_base(server.uri());
        let err = model
            .generate(ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        match err {
            Error::ProviderPermanent { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("bad messages"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn prompt_mode_strips_tools_from_body() {
        let model = OpenAiCompatModel::new("local-llm").with_prompt_mode(true);
        assert!(!model.supports_native_tools());
        let request = ChatRequest::new(vec![Message::user("hi")])
            .with_tools(vec![json!({"name": "echo"})]);
        let body = model.build_body(&request);
        assert!(body.tools.is_none());
    }

    #[test]
    fn wire_message_round_trip_for_tool_roles() {
        let msg = Message::tool_result("call_9", "shell", "ok");
        let wire = to_wire_message(&msg);
        assert_eq!(wire.role, "tool");
        assert_eq!(wire.tool_call_id.as_deref(), Some("call_9"));

        let assistant = Message::assistant_with_tools(
            "",
            vec![ToolCall::new("c", "echo", json!({"msg": "x"}))],
        );
        let wire = to_wire_message(&assistant);
        let calls = wire.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "echo");
        assert!(calls[0].function.arguments.contains("msg"));
    }
}
