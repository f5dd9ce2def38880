//! MCP tool discovery: spawn configured JSON-RPC servers as child processes,
//! introspect `tools/list`, and register each remote tool as a skill whose
//! callable proxies a `tools/call` request.
//!
//! Transport is newline-delimited JSON-RPC 2.0 over the child's stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use rvbbit_core::{Error, Result, Tool, ToolInput};

use crate::{SkillOrigin, SkillRegistry};

/// Configuration for one MCP server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Handle to a running MCP server.
pub struct McpConnection {
    pub server: String,
    pub tools: Vec<String>,
    client: Arc<McpClient>,
}

impl McpConnection {
    pub fn is_alive(&self) -> bool {
        self.client.is_alive()
    }
}

struct McpClientInner {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

/// JSON-RPC client over a child process's stdio. Requests are serialized;
/// MCP servers answer in order on this transport.
pub struct McpClient {
    server: String,
    inner: Mutex<Option<McpClientInner>>,
}

impl McpClient {
    /// Spawn the server process and run the MCP initialize handshake.
    pub async fn connect(config: &McpServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Other(format!("mcp server '{}' spawn failed: {e}", config.name))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Other("mcp child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("mcp child stdout unavailable".into()))?;

        let client = Self {
            server: config.name.clone(),
            inner: Mutex::new(Some(McpClientInner {
                child,
                stdin,
                stdout: BufReader::new(stdout),
                next_id: 1,
            })),
        };

        client
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "clientInfo": { "name": "rvbbit", "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": {}
                }),
            )
            .await?;
        client.notify("notifications/initialized", json!({})).await?;
        Ok(client)
    }

    pub fn is_alive(&self) -> bool {
        match self.inner.try_lock() {
            Ok(guard) => guard.is_some(),
            Err(_) => true, // busy means running
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = guard
            .as_mut()
            .ok_or_else(|| Error::Other(format!("mcp server '{}' is closed", self.server)))?;
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        write_line(inner, &msg).await
    }

    /// Send a request and wait for the matching response line.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let mut guard = self.inner.lock().await;
        let inner = guard
            .as_mut()
            .ok_or_else(|| Error::Other(format!("mcp server '{}' is closed", self.server)))?;

        let id = inner.next_id;
        inner.next_id += 1;
        let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        write_line(inner, &msg).await?;

        loop {
            let mut line = String::new();
            let n = inner
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Other(format!("mcp read: {e}")))?;
            if n == 0 {
                *guard = None;
                return Err(Error::Other(format!(
                    "mcp server '{}' closed its stdout",
                    self.server
                )));
            }
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                tracing::warn!(server = %self.server, "skipping non-JSON mcp output line");
                continue;
            };
            // Server-initiated notifications are interleaved; skip them.
            if value.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = value.get("error") {
                return Err(Error::Other(format!(
                    "mcp '{}' {method} error: {error}",
                    self.server
                )));
            }
            return Ok(value.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut inner) = guard.take() {
            let _ = inner.child.kill().await;
        }
    }
}

async fn write_line(inner: &mut McpClientInner, msg: &Value) -> Result<()> {
    let mut line = msg.to_string();
    line.push('\n');
    inner
        .stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| Error::Other(format!("mcp write: {e}")))?;
    inner
        .stdin
        .flush()
        .await
        .map_err(|e| Error::Other(format!("mcp flush: {e}")))
}

/// A remote MCP tool proxied as a local skill.
pub struct McpTool {
    name: String,
    remote_name: String,
    description: String,
    schema: Value,
    client: Arc<McpClient>,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn args_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn call(&self, input: ToolInput) -> Result<String> {
        let result = self
            .client
            .request(
                "tools/call",
                json!({ "name": self.remote_name, "arguments": input.to_json() }),
            )
            .await?;

        // MCP results carry a content array of typed blocks; concatenate the
        // text blocks.
        if let Some(blocks) = result.get("content").and_then(Value::as_array) {
            let text: String = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if result
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                return Err(Error::tool(&self.name, text));
            }
            return Ok(text);
        }
        Ok(result.to_string())
    }
}

/// Start each configured server, introspect its tools, and register them.
/// Returns one connection handle per successfully started server.
pub async fn discover_mcp(
    registry: &SkillRegistry,
    configs: &[McpServerConfig],
) -> Result<Vec<McpConnection>> {
    let mut connections = Vec::new();
    for config in configs {
        let client = match McpClient::connect(config).await {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::warn!(server = %config.name, "mcp connect failed: {e}");
                continue;
            }
        };

        let listing = client.request("tools/list", json!({})).await?;
        let tools = listing
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut names = Vec::new();
        for tool in tools {
            let Some(remote_name) = tool.get("name").and_then(Value::as_str) else {
                continue;
            };
            // Prefer the bare name; fall back to a server-qualified one on
            // collision.
            let local_name = if registry.contains(remote_name) {
                format!("{}_{remote_name}", config.name)
            } else {
                remote_name.to_string()
            };
            let skill = McpTool {
                name: local_name.clone(),
                remote_name: remote_name.to_string(),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                schema: tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object" })),
                client: client.clone(),
            };
            match registry.register(Arc::new(skill), SkillOrigin::Mcp) {
                Ok(()) => names.push(local_name),
                Err(e) => tracing::warn!("mcp tool registration failed: {e}"),
            }
        }

        connections.push(McpConnection {
            server: config.name.clone(),
            tools: names,
            client,
        });
    }
    Ok(connections)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny MCP server written in shell: answers initialize, tools/list,
    /// and tools/call line-by-line.
    fn fake_server_script() -> String {
        r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"fake"}}}' ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"reverse","description":"Reverse text","inputSchema":{"type":"object"}}]}}' ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"olleh"}]}}' ;;
  esac
done
"#
        .to_string()
    }

    #[tokio::test]
    async fn discovers_and_calls_remote_tool() {
        let config = McpServerConfig {
            name: "fake".into(),
            command: "sh".into(),
            args: vec!["-c".into(), fake_server_script()],
            env: HashMap::new(),
        };
        let registry = SkillRegistry::new();
        let connections = discover_mcp(&registry, &[config]).await.unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].tools, vec!["reverse".to_string()]);

        let tool = registry.get("reverse").unwrap();
        let out = tool
            .call(ToolInput::Structured(json!({"text": "hello"})))
            .await
            .unwrap();
        assert_eq!(out, "olleh");

        connections[0].client.close().await;
    }

    #[tokio::test]
    async fn unreachable_server_is_skipped() {
        let config = McpServerConfig {
            name: "ghost".into(),
            command: "/nonexistent/binary/xyz".into(),
            args: vec![],
            env: HashMap::new(),
        };
        let registry = SkillRegistry::new();
        let connections = discover_mcp(&registry, &[config]).await.unwrap();
        assert!(connections.is_empty());
    }
}
