//! The agent loop: one LLM turn-loop with tool execution and error feedback.
//!
//! Each turn: enforce the token budget, invoke the provider, execute any
//! requested tools (native function calls, or fenced-JSON intents in prompt
//! mode), feed results back, and stop when the assistant answers without
//! tools, the turn budget runs out, or an error is unrecoverable.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;

use rvbbit_budget::TokenBudgeter;
use rvbbit_cache::ResultCache;
use rvbbit_core::{Error, Message, Result, Tool, ToolCall, ToolInput};
use rvbbit_events::NodeKind;
use rvbbit_providers::{ChatModel, ChatRequest, Usage};

use crate::events::EventScope;

/// Result of one agent-loop run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Final assistant content (empty when the loop ended without one).
    pub content: String,
    /// The full message list, including appended turns.
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub turns: u32,
    /// True when the turn budget ran out while the model still wanted tools.
    pub exhausted: bool,
}

/// One configured agent loop, bound to a model, tool set, and event scope.
pub struct AgentLoop {
    pub model: Arc<dyn ChatModel>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub cache: Option<Arc<ResultCache>>,
    pub budgeter: Option<Arc<TokenBudgeter>>,
    pub scope: EventScope,
    pub llm_semaphore: Arc<Semaphore>,
    pub shell_semaphore: Arc<Semaphore>,
    pub browser_semaphore: Arc<Semaphore>,
    pub max_turns: u32,
    pub parallel_tools: bool,
}

impl AgentLoop {
    pub async fn run(&self, mut messages: Vec<Message>) -> Result<AgentOutcome> {
        let prompt_mode = !self.model.supports_native_tools() && !self.tools.is_empty();
        if prompt_mode {
            messages.push(Message::system(prompt_mode_preamble(&self.tools)));
        }

        let schemas: Vec<Value> = self
            .tools
            .iter()
            .map(|t| rvbbit_core::tools::tool_schema(t.as_ref()))
            .collect();

        let mut usage = Usage::default();
        let mut final_content = String::new();
        let mut exhausted = false;
        let mut turns = 0u32;

        for turn in 1..=self.max_turns {
            turns = turn;

            if let Some(budgeter) = &self.budgeter {
                messages = budgeter.enforce(&messages)?;
            }

            let request = ChatRequest {
                messages: messages.clone(),
                tools: if prompt_mode { Vec::new() } else { schemas.clone() },
                temperature: None,
                max_tokens: None,
            };

            let response = {
                let _permit = self
                    .llm_semaphore
                    .acquire()
                    .await
                    .map_err(|_| Error::Cancelled)?;
                self.model.generate(request).await
            };
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    self.scope.emit_error(&e);
                    return Err(e);
                }
            };
            usage.add(&response.usage);

            let mut tool_calls = response.tool_calls.clone();
            if tool_calls.is_empty() && prompt_mode {
                match parse_prompt_tool_calls(&response.content) {
                    Ok(parsed) => tool_calls = parsed,
                    Err(parse_error) => {
                        // A malformed block that names a tool: report it as a
                        // structured error and retry the turn.
                        if !response.content.is_empty() {
                            messages.push(Message::assistant(response.content.clone()));
                        }
                        messages.push(Message::user(
                            json!({
                                "error": "tool_call_parse_error",
                                "detail": parse_error,
                            })
                            .to_string(),
                        ));
                        self.scope.emit(
                            NodeKind::Error,
                            json!({ "error": format!("tool call parse error: {parse_error}") }),
                        );
                        continue;
                    }
                }
            }

            if tool_calls.is_empty() {
                // Empty content and no tool calls ends the turn; the empty
                // assistant message is never appended.
                if response.content.is_empty() {
                    break;
                }
                self.scope.emit_event(
                    self.scope
                        .event(NodeKind::AgentMsg)
                        .with_role("assistant")
                        .with_content(json!({ "text": response.content }))
                        .with_usage(
                            response.usage.prompt_tokens,
                            response.usage.completion_tokens,
                            response.usage.cost,
                        ),
                );
                final_content = response.content.clone();
                messages.push(Message::assistant(response.content));
                break;
            }

            self.scope.emit_event(
                self.scope
                    .event(NodeKind::AgentMsg)
                    .with_role("assistant")
                    .with_content(json!({ "text": response.content }))
                    .with_tool_calls(serde_json::to_value(&tool_calls)?)
                    .with_usage(
                        response.usage.prompt_tokens,
                        response.usage.completion_tokens,
                        response.usage.cost,
                    ),
            );
            messages.push(Message::assistant_with_tools(
                response.content.clone(),
                tool_calls.clone(),
            ));

            if turn == self.max_turns {
                let e = Error::Other(format!(
                    "turn budget exhausted after {turn} turns with tools still requested"
                ));
                self.scope.emit_error(&e);
                exhausted = true;
                break;
            }

            let results = if self.parallel_tools && tool_calls.len() > 1 {
                futures::future::join_all(tool_calls.iter().map(|c| self.execute_one(c))).await
            } else {
                let mut out = Vec::with_capacity(tool_calls.len());
                for call in &tool_calls {
                    out.push(self.execute_one(call).await);
                }
                out
            };
            messages.extend(results);
        }

        Ok(AgentOutcome {
            content: final_content,
            messages,
            usage,
            turns,
            exhausted,
        })
    }

    /// Execute one tool call, converting failures into feedback messages so
    /// the model can self-correct.
    async fn execute_one(&self, call: &ToolCall) -> Message {
        self.scope.emit_event(
            self.scope
                .event(NodeKind::ToolCall)
                .with_role("assistant")
                .with_content(json!({ "tool": call.name, "args": call.args })),
        );

        match self.call_tool(call).await {
            Ok(result) => {
                self.scope.emit_event(
                    self.scope
                        .event(NodeKind::ToolResult)
                        .with_role("tool")
                        .with_content(json!({ "tool": call.name, "result": result })),
                );
                Message::tool_result(&call.id, &call.name, result)
            }
            Err(e) => {
                self.scope.emit_error(&e);
                Message::tool_error(&call.id, &call.name, e.to_string())
            }
        }
    }

    async fn call_tool(&self, call: &ToolCall) -> Result<String> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == call.name)
            .cloned()
            .ok_or_else(|| Error::UnknownSkill(call.name.clone()))?;

        // Resource-class semaphores: shell and browser cells are scarcer
        // than LLM calls.
        let semaphore = if tool.name() == "shell" {
            Some(&self.shell_semaphore)
        } else if tool.name().starts_with("browser") {
            Some(&self.browser_semaphore)
        } else {
            None
        };
        let _permit = match semaphore {
            Some(s) => Some(s.acquire().await.map_err(|_| Error::Cancelled)?),
            None => None,
        };

        let input = ToolInput::from(call.args.clone());

        if let (Some(cache), Some(policy)) = (&self.cache, tool.cache_policy()) {
            let args = input.to_json();
            let tool_for_build = tool.clone();
            let args_for_build = args.clone();
            let value = cache
                .get_or_build(tool.name(), &args, &policy, move || async move {
                    tool_for_build
                        .call(ToolInput::from(args_for_build))
                        .await
                        .map(Value::String)
                })
                .await?;
            return Ok(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        }

        tool.call(input).await
    }
}

/// System preamble describing the fenced-JSON tool protocol for providers
/// without native function calling.
fn prompt_mode_preamble(tools: &[Arc<dyn Tool>]) -> String {
    let mut out = String::from(
        "You can call tools. To call one, reply with a fenced json block whose \
         object has a top-level \"tool\" key and an \"args\" object:\n\
         ```json\n{\"tool\": \"<name>\", \"args\": {}}\n```\n\
         Any json block without a \"tool\" key is treated as plain content.\n\
         Available tools:\n",
    );
    for tool in tools {
        out.push_str(&format!(
            "- {}: {} (schema: {})\n",
            tool.name(),
            tool.description(),
            tool.args_schema()
        ));
    }
    out
}

/// Scan fenced ```json blocks for tool-call intents.
///
/// A block is a tool call iff its parsed object has a top-level `tool` key.
/// Blocks that do not parse are ignored unless they contain the literal
/// `"tool"`, which is reported as a parse error for the model to repair.
pub fn parse_prompt_tool_calls(content: &str) -> std::result::Result<Vec<ToolCall>, String> {
    let mut calls = Vec::new();
    let mut counter = 0usize;

    for block in fenced_json_blocks(content) {
        match serde_json::from_str::<Value>(&block) {
            Ok(Value::Object(obj)) => {
                if let Some(tool) = obj.get("tool").and_then(Value::as_str) {
                    let args = obj
                        .get("args")
                        .or_else(|| obj.get("arguments"))
                        .cloned()
                        .unwrap_or_else(|| json!({}));
                    counter += 1;
                    calls.push(ToolCall::new(
                        format!("prompt-{counter}"),
                        tool.to_string(),
                        args,
                    ));
                }
                // Objects without a `tool` key are illustrative JSON.
            }
            Ok(_) => {}
            Err(e) => {
                if block.contains("\"tool\"") {
                    return Err(format!("malformed tool-call json block: {e}"));
                }
            }
        }
    }
    Ok(calls)
}

/// Extract the bodies of ```json fenced blocks. Other fences are opaque.
fn fenced_json_blocks(content: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("```json") {
        let after = &rest[start + "```json".len()..];
        let after = after.strip_prefix('\n').unwrap_or(after);
        match after.find("```") {
            Some(end) => {
                blocks.push(after[..end].trim().to_string());
                rest = &after[end + 3..];
            }
            None => break,
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvbbit_events::{EventLog, EventLogConfig};
    use rvbbit_providers::MockChatModel;
    use rvbbit_registry::builtin::{EchoTool, UppercaseTool};

    fn scope(log: EventLog) -> EventScope {
        EventScope::new(log, "sess", "casc", "caller", 0).for_cell("test_cell")
    }

    fn test_log() -> (EventLog, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::start(EventLogConfig::new(tmp.path())).unwrap();
        (log, tmp)
    }

    fn agent(model: Arc<dyn ChatModel>, tools: Vec<Arc<dyn Tool>>, log: EventLog) -> AgentLoop {
        AgentLoop {
            model,
            tools,
            cache: None,
            budgeter: None,
            scope: scope(log),
            llm_semaphore: Arc::new(Semaphore::new(4)),
            shell_semaphore: Arc::new(Semaphore::new(1)),
            browser_semaphore: Arc::new(Semaphore::new(1)),
            max_turns: 4,
            parallel_tools: false,
        }
    }

    #[tokio::test]
    async fn plain_answer_ends_after_one_turn() {
        let (log, _tmp) = test_log();
        let mock = Arc::new(MockChatModel::new());
        mock.push_text("the answer");
        let outcome = agent(mock, vec![], log)
            .run(vec![Message::user("question")])
            .await
            .unwrap();
        assert_eq!(outcome.content, "the answer");
        assert_eq!(outcome.turns, 1);
        assert!(!outcome.exhausted);
    }

    #[tokio::test]
    async fn native_tool_call_round_trip() {
        let (log, _tmp) = test_log();
        let mock = Arc::new(MockChatModel::new());
        mock.push_tool_calls(vec![ToolCall::new(
            "c1",
            "uppercase",
            json!({"text": "hi"}),
        )]);
        mock.push_text("done: HI");

        let outcome = agent(mock, vec![Arc::new(UppercaseTool)], log)
            .run(vec![Message::user("uppercase hi")])
            .await
            .unwrap();

        assert_eq!(outcome.content, "done: HI");
        // user, assistant(tool call), tool result, assistant
        assert_eq!(outcome.messages.len(), 4);
        let tool_msg = &outcome.messages[2];
        assert_eq!(tool_msg.role, rvbbit_core::Role::Tool);
        assert!(tool_msg.content.contains("HI"));
    }

    #[tokio::test]
    async fn unknown_tool_is_fed_back_not_fatal() {
        let (log, _tmp) = test_log();
        let mock = Arc::new(MockChatModel::new());
        mock.push_tool_calls(vec![ToolCall::new("c1", "imaginary", json!({}))]);
        mock.push_text("sorry, wrong tool");

        let outcome = agent(mock, vec![Arc::new(EchoTool)], log)
            .run(vec![Message::user("go")])
            .await
            .unwrap();
        assert_eq!(outcome.content, "sorry, wrong tool");
        let feedback = &outcome.messages[2];
        assert!(feedback.content.contains("unknown skill"));
    }

    #[tokio::test]
    async fn turn_budget_exhaustion_is_flagged() {
        let (log, _tmp) = test_log();
        let mock = Arc::new(MockChatModel::new());
        for _ in 0..4 {
            mock.push_tool_calls(vec![ToolCall::new("c", "echo", json!({"msg": "again"}))]);
        }
        let outcome = agent(mock, vec![Arc::new(EchoTool)], log)
            .run(vec![Message::user("loop forever")])
            .await
            .unwrap();
        assert!(outcome.exhausted);
        assert_eq!(outcome.turns, 4);
    }

    #[tokio::test]
    async fn prompt_mode_parses_fenced_tool_call() {
        let (log, _tmp) = test_log();
        let mock = Arc::new(MockChatModel::new().with_native_tools(false));
        mock.push_text(
            "I'll uppercase that.\n```json\n{\"tool\": \"uppercase\", \"args\": {\"text\": \"hey\"}}\n```",
        );
        mock.push_text("HEY it is");

        let outcome = agent(mock.clone(), vec![Arc::new(UppercaseTool)], log)
            .run(vec![Message::user("uppercase hey")])
            .await
            .unwrap();
        assert_eq!(outcome.content, "HEY it is");
        // Prompt-mode requests must not carry native tool schemas.
        assert!(mock.requests().iter().all(|r| r.tools.is_empty()));
    }

    #[tokio::test]
    async fn prompt_mode_ignores_illustrative_json() {
        let (log, _tmp) = test_log();
        let mock = Arc::new(MockChatModel::new().with_native_tools(false));
        mock.push_text("Here's an example config:\n```json\n{\"retries\": 3}\n```");

        let outcome = agent(mock, vec![Arc::new(EchoTool)], log)
            .run(vec![Message::user("show config")])
            .await
            .unwrap();
        assert!(outcome.content.contains("example config"));
        assert_eq!(outcome.turns, 1);
    }

    #[tokio::test]
    async fn prompt_mode_reports_malformed_tool_block() {
        let (log, _tmp) = test_log();
        let mock = Arc::new(MockChatModel::new().with_native_tools(false));
        mock.push_text("```json\n{\"tool\": \"echo\", \"args\": {broken}\n```");
        mock.push_text("fine, no tools then");

        let outcome = agent(mock, vec![Arc::new(EchoTool)], log)
            .run(vec![Message::user("go")])
            .await
            .unwrap();
        assert_eq!(outcome.content, "fine, no tools then");
        // The structured parse error was fed back as a user message.
        assert!(outcome
            .messages
            .iter()
            .any(|m| m.content.contains("tool_call_parse_error")));
    }

    #[test]
    fn fenced_block_scanner_finds_multiple() {
        let content = "a\n```json\n{\"x\":1}\n```\nmid\n```json\n{\"tool\":\"t\"}\n```\n";
        let blocks = fenced_json_blocks(content);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn parse_rules_match_spec() {
        // Tool key present: a call.
        let calls =
            parse_prompt_tool_calls("```json\n{\"tool\": \"shell\", \"args\": {\"command\": \"ls\"}}\n```")
                .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "shell");

        // No tool key: ignored.
        let calls = parse_prompt_tool_calls("```json\n{\"data\": [1,2]}\n```").unwrap();
        assert!(calls.is_empty());

        // Malformed without "tool": ignored.
        let calls = parse_prompt_tool_calls("```json\n{nope}\n```").unwrap();
        assert!(calls.is_empty());

        // Malformed with "tool": error.
        assert!(parse_prompt_tool_calls("```json\n{\"tool\": broken}\n```").is_err());

        // Non-json fences are opaque.
        let calls =
            parse_prompt_tool_calls("```python\n{\"tool\": \"x\"}\n```").unwrap();
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn provider_permanent_error_propagates() {
        let (log, _tmp) = test_log();
        let mock = Arc::new(MockChatModel::new());
        mock.push_error(Error::ProviderPermanent {
            status: 400,
            body: "bad request body".into(),
        });
        let err = agent(mock, vec![], log)
            .run(vec![Message::user("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderPermanent { .. }));
    }
}
