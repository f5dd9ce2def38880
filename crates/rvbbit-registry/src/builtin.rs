//! Builtin tools registered at startup.
//!
//! Heavyweight tools (browser, code runners, RAG indexers) are external
//! collaborators and register through the same API; what lives here is the
//! small set the engine and its tests rely on.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use rvbbit_core::tools::CachePolicy;
use rvbbit_core::{Error, Result, Tool, ToolInput};

use crate::{SkillOrigin, SkillRegistry};

/// Register the builtin tool set. Collisions are ignored so callers can
/// pre-register replacements.
pub fn register_builtins(registry: &SkillRegistry) {
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(EchoTool),
        Arc::new(UppercaseTool),
        Arc::new(ShellTool::new()),
        Arc::new(ReadFileTool::new()),
        Arc::new(HttpGetTool::new()),
    ];
    for tool in tools {
        if let Err(e) = registry.register(tool, SkillOrigin::Builtin) {
            tracing::debug!("builtin registration skipped: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// echo
// ---------------------------------------------------------------------------

/// Returns its arguments unchanged, as JSON.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the input arguments unchanged"
    }

    async fn call(&self, input: ToolInput) -> Result<String> {
        Ok(input.to_json().to_string())
    }
}

// ---------------------------------------------------------------------------
// uppercase
// ---------------------------------------------------------------------------

/// Uppercases the `text` argument.
pub struct UppercaseTool;

#[async_trait]
impl Tool for UppercaseTool {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn description(&self) -> &str {
        "Uppercase the `text` argument"
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn call(&self, input: ToolInput) -> Result<String> {
        let text = match &input {
            ToolInput::String(s) => s.clone(),
            ToolInput::Structured(_) => input
                .get_str("text")
                .ok_or_else(|| Error::tool("uppercase", "missing 'text' argument"))?,
        };
        Ok(json!({ "text": text.to_uppercase() }).to_string())
    }
}

// ---------------------------------------------------------------------------
// shell
// ---------------------------------------------------------------------------

/// Run a shell command, allowlist-guarded.
///
/// Commands are split with shlex and executed directly (no `sh -c`), so shell
/// metacharacters have no effect. Output is capped and the process killed on
/// timeout.
pub struct ShellTool {
    allowed_commands: Option<Vec<String>>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ShellTool {
    pub fn new() -> Self {
        Self {
            allowed_commands: None,
            timeout: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
        }
    }

    pub fn with_allowed_commands(mut self, commands: Vec<String>) -> Self {
        self.allowed_commands = Some(commands);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output"
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "command": { "type": "string" } },
            "required": ["command"]
        })
    }

    async fn call(&self, input: ToolInput) -> Result<String> {
        let command = match &input {
            ToolInput::String(s) => s.clone(),
            ToolInput::Structured(_) => input
                .get_str("command")
                .ok_or_else(|| Error::tool("shell", "missing 'command' argument"))?,
        };

        let words = shlex::split(&command)
            .ok_or_else(|| Error::tool("shell", "unbalanced quotes in command"))?;
        let program = words
            .first()
            .ok_or_else(|| Error::tool("shell", "empty command"))?;

        if let Some(allowed) = &self.allowed_commands {
            if !allowed.iter().any(|a| a == program) {
                return Err(Error::tool(
                    "shell",
                    format!("command '{program}' not in allowed list"),
                ));
            }
        }

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&words[1..])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
            .map_err(|e| Error::tool("shell", format!("spawn failed: {e}")))?;

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stdout.len() > self.max_output_bytes {
            stdout.truncate(self.max_output_bytes);
            stdout.push_str("\n[output truncated]");
        }

        if !output.status.success() {
            return Err(Error::tool(
                "shell",
                format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }
        Ok(stdout)
    }
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

/// Read a UTF-8 file, optionally restricted to a root directory.
pub struct ReadFileTool {
    root: Option<PathBuf>,
    max_bytes: usize,
}

impl ReadFileTool {
    pub fn new() -> Self {
        Self {
            root: None,
            max_bytes: 1024 * 1024,
        }
    }

    pub fn with_root(mut self, root: PathBuf) -> Self {
        self.root = Some(root);
        self
    }
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file and return its contents"
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    async fn call(&self, input: ToolInput) -> Result<String> {
        let path = input
            .get_str("path")
            .ok_or_else(|| Error::tool("read_file", "missing 'path' argument"))?;
        let path = PathBuf::from(path);

        if let Some(root) = &self.root {
            let canonical = tokio::fs::canonicalize(&path)
                .await
                .map_err(|e| Error::tool("read_file", e.to_string()))?;
            if !canonical.starts_with(root) {
                return Err(Error::tool(
                    "read_file",
                    format!("path escapes root: {}", canonical.display()),
                ));
            }
        }

        let mut content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::tool("read_file", e.to_string()))?;
        if content.len() > self.max_bytes {
            content.truncate(self.max_bytes);
            content.push_str("\n[truncated]");
        }
        Ok(content)
    }
}

// ---------------------------------------------------------------------------
// http_get
// ---------------------------------------------------------------------------

/// Fetch a URL and return the body text. Results cache for five minutes.
pub struct HttpGetTool {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpGetTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            max_bytes: 2 * 1024 * 1024,
        }
    }
}

impl Default for HttpGetTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpGetTool {
    fn name(&self) -> &str {
        "http_get"
    }

    fn description(&self) -> &str {
        "HTTP GET a URL and return the response body"
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "url": { "type": "string" } },
            "required": ["url"]
        })
    }

    fn cache_policy(&self) -> Option<CachePolicy> {
        Some(CachePolicy::with_ttl(300))
    }

    async fn call(&self, input: ToolInput) -> Result<String> {
        let url = input
            .get_str("url")
            .ok_or_else(|| Error::tool("http_get", "missing 'url' argument"))?;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::tool("http_get", e.to_string()))?;
        let status = response.status();
        let mut body = response
            .text()
            .await
            .map_err(|e| Error::tool("http_get", e.to_string()))?;
        if !status.is_success() {
            return Err(Error::tool("http_get", format!("status {status}: {body}")));
        }
        if body.len() > self.max_bytes {
            body.truncate(self.max_bytes);
            body.push_str("\n[truncated]");
        }
        Ok(body)
    }
}
