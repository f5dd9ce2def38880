//! Error taxonomy shared by every RVBBIT crate.
//!
//! One enum covers the whole engine so errors can cross crate boundaries
//! without re-wrapping. Variants map one-to-one onto the failure kinds the
//! scheduler's `on_error` policies and the CLI exit codes distinguish.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid cascade YAML or a missing required field. `path` points into
    /// the YAML document (e.g. `cells[2].candidates.mode`).
    #[error("config error at {path}: {message}")]
    Config { path: String, message: String },

    /// A cell references a tool name that is not in the registry.
    #[error("unknown skill: {0}")]
    UnknownSkill(String),

    /// LLM HTTP 429/5xx/network failure. Retried with backoff.
    #[error("provider transient error (status {status}): {message}")]
    ProviderTransient { status: u16, message: String },

    /// LLM HTTP 4xx (non-429). Surfaces with the full response body.
    #[error("provider permanent error (status {status}): {body}")]
    ProviderPermanent { status: u16, body: String },

    /// Raised by a tool's callable; captured and fed back to the agent.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// A required output extraction did not match, or two required
    /// extractions produced conflicting values for the same key.
    #[error("extraction '{name}' failed: {message}")]
    Extraction { name: String, message: String },

    /// A validator cell returned pass=false.
    #[error("validation failed in cell '{cell}': {reason}")]
    ValidationFailed { cell: String, reason: String },

    /// Only raised by the `fail` budget strategy.
    #[error("token budget exceeded: {current} tokens + {reserve} reserved > {limit} limit")]
    TokenBudgetExceeded {
        current: usize,
        reserve: usize,
        limit: usize,
    },

    /// A cell or LLM call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Parent or user cancelled the work.
    #[error("cancelled")]
    Cancelled,

    /// Malformed wire message on the PG server; closes the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Template rendering failure (bad expression, missing variable).
    #[error("template error: {0}")]
    Template(String),

    /// OLAP adapter / SQL execution failure.
    #[error("sql error: {0}")]
    Sql(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a config error with a YAML path.
    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a tool execution failure.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Transient errors are retried with backoff; everything else surfaces.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ProviderTransient { .. })
    }

    /// Whether the agent loop should offer this error back to the model for
    /// self-correction instead of failing the cell outright.
    pub fn is_agent_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ToolExecution { .. } | Error::Extraction { .. }
        )
    }

    /// CLI exit code: 0 success, 1 validation, 2 execution, 3 configuration.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config { .. } => 1,
            Error::Protocol(_) => 3,
            _ => 2,
        }
    }
}
