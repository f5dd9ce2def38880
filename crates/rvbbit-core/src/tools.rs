//! The tool ("skill") contract.
//!
//! A tool is anything a cell can call: a builtin function, a sub-cascade, or
//! a remote MCP tool. The registry maps names to `Arc<dyn Tool>`; the result
//! cache consults each tool's [`CachePolicy`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Input handed to a tool call. Structured is the common case; plain strings
/// come from prompt-mode models that emit a bare argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInput {
    String(String),
    Structured(serde_json::Value),
}

impl ToolInput {
    /// Normalize to JSON. Plain strings become `{"input": "..."}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ToolInput::String(s) => serde_json::json!({ "input": s }),
            ToolInput::Structured(v) => v.clone(),
        }
    }

    /// Fetch a named string argument, if present.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self {
            ToolInput::String(_) => None,
            ToolInput::Structured(v) => {
                v.get(key).and_then(|x| x.as_str()).map(str::to_string)
            }
        }
    }
}

impl From<serde_json::Value> for ToolInput {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => ToolInput::String(s),
            other => ToolInput::Structured(other),
        }
    }
}

/// How a tool's results are fingerprinted for the result cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySpec {
    /// Hash the full, canonically-serialized argument object.
    #[default]
    ArgsHash,
    /// Hash only the named `query` argument.
    Query,
    /// Hash only the named `sql` argument.
    SqlHash,
    /// Call a named key function registered with the cache.
    Custom(String),
}

/// Per-tool cache policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Seconds before a cached result is treated as a miss.
    pub ttl_secs: u64,
    #[serde(default)]
    pub key: KeySpec,
    /// Invalidation event names that purge entries for this tool.
    #[serde(default)]
    pub invalidate_on: Vec<String>,
}

impl CachePolicy {
    pub fn with_ttl(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            key: KeySpec::default(),
            invalidate_on: Vec::new(),
        }
    }
}

/// A callable skill.
///
/// Implementations must be cheap to clone behind `Arc` and safe to call
/// concurrently; any internal state needs its own synchronization.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry name (globally unique within a process).
    fn name(&self) -> &str;

    /// Human/model-facing description.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn args_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    /// Cache policy, if results should be cached.
    fn cache_policy(&self) -> Option<CachePolicy> {
        None
    }

    /// Execute the tool.
    async fn call(&self, input: ToolInput) -> Result<String>;
}

/// Tool schema in the wire shape providers expect.
pub fn tool_schema(tool: &dyn Tool) -> serde_json::Value {
    serde_json::json!({
        "name": tool.name(),
        "description": tool.description(),
        "parameters": tool.args_schema(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "uppercase"
        }
        fn description(&self) -> &str {
            "Uppercase the input text"
        }
        async fn call(&self, input: ToolInput) -> Result<String> {
            let text = input
                .get_str("text")
                .unwrap_or_else(|| match input {
                    ToolInput::String(s) => s,
                    _ => String::new(),
                });
            Ok(text.to_uppercase())
        }
    }

    #[tokio::test]
    async fn call_with_structured_input() {
        let tool = Upper;
        let out = tool
            .call(ToolInput::Structured(serde_json::json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(out, "HI");
    }

    #[tokio::test]
    async fn call_with_string_input() {
        let out = Upper.call(ToolInput::String("hey".into())).await.unwrap();
        assert_eq!(out, "HEY");
    }

    #[test]
    fn key_spec_serde() {
        let k: KeySpec = serde_json::from_str("\"sql_hash\"").unwrap();
        assert_eq!(k, KeySpec::SqlHash);
        let k: KeySpec = serde_json::from_str("{\"custom\":\"my_key_fn\"}").unwrap();
        assert_eq!(k, KeySpec::Custom("my_key_fn".into()));
    }

    #[test]
    fn schema_shape() {
        let schema = tool_schema(&Upper);
        assert_eq!(schema["name"], "uppercase");
        assert!(schema["parameters"].is_object());
    }

    #[test]
    fn input_normalization() {
        let s = ToolInput::String("x".into());
        assert_eq!(s.to_json()["input"], "x");
        let v = ToolInput::from(serde_json::json!({"a": 1}));
        assert!(matches!(v, ToolInput::Structured(_)));
    }
}
