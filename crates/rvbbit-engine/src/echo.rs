//! The `Echo`: in-memory run state for one cascade execution.
//!
//! Owned exclusively by the supervisor task of its cascade; workers receive
//! immutable snapshots and report back over channels, so nothing here needs
//! locking.

use serde_json::{Map, Value};

use rvbbit_core::caller::InvocationMetadata;
use rvbbit_core::template::TemplateScope;
use rvbbit_core::Message;
use rvbbit_providers::Usage;

/// One recorded cell transcript, kept for downstream context assembly.
#[derive(Debug, Clone)]
pub struct CellRecord {
    /// Ordinal of the cell in execution order.
    pub index: usize,
    pub cell_name: String,
    pub messages: Vec<Message>,
    /// Final assistant content (or tool output) of the cell.
    pub final_output: String,
}

/// An error recorded during execution.
#[derive(Debug, Clone)]
pub struct EchoError {
    pub cell_name: String,
    pub message: String,
    /// True when an `on_error: continue` policy absorbed it.
    pub absorbed: bool,
}

/// Terminal status of a cascade run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeStatus {
    Completed,
    Failed,
}

/// In-memory state for a single cascade execution.
#[derive(Debug, Clone)]
pub struct Echo {
    pub session_id: String,
    pub cascade_id: String,
    pub caller_id: String,
    pub invocation_metadata: InvocationMetadata,
    pub inputs: Value,
    /// Mutable key/value state, addressed by templates as `state.X`.
    pub state: Map<String, Value>,
    /// Cell name -> structured result, addressed as `outputs.<cell>`.
    pub outputs: Map<String, Value>,
    pub errors: Vec<EchoError>,
    pub depth: u32,
    pub parent_session_id: Option<String>,
    /// Per-cell transcripts in execution order.
    pub records: Vec<CellRecord>,
    pub usage: Usage,
}

impl Echo {
    pub fn new(
        cascade_id: impl Into<String>,
        inputs: Value,
        caller_id: Option<String>,
        metadata: InvocationMetadata,
        depth: u32,
        parent_session_id: Option<String>,
    ) -> Self {
        let session_id = rvbbit_core::ids::new_session_id();
        // A top-level run with no external caller is its own caller.
        let caller_id = caller_id.unwrap_or_else(|| session_id.clone());
        Self {
            session_id,
            cascade_id: cascade_id.into(),
            caller_id,
            invocation_metadata: metadata,
            inputs,
            state: Map::new(),
            outputs: Map::new(),
            errors: Vec::new(),
            depth,
            parent_session_id,
            records: Vec::new(),
            usage: Usage::default(),
        }
    }

    /// Template scope over the current inputs/state/outputs.
    pub fn scope(&self) -> TemplateScope {
        TemplateScope::new(
            self.inputs.clone(),
            Value::Object(self.state.clone()),
            Value::Object(self.outputs.clone()),
        )
    }

    /// Whether any recorded error was left unabsorbed.
    pub fn has_unresolved_errors(&self) -> bool {
        self.errors.iter().any(|e| !e.absorbed)
    }

    pub fn status(&self) -> CascadeStatus {
        if self.has_unresolved_errors() {
            CascadeStatus::Failed
        } else {
            CascadeStatus::Completed
        }
    }
}

/// Final result handed back to callers.
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub session_id: String,
    pub cascade_id: String,
    pub status: CascadeStatus,
    pub outputs: Map<String, Value>,
    pub state: Map<String, Value>,
    pub errors: Vec<EchoError>,
    pub usage: Usage,
}

impl CascadeOutcome {
    pub fn from_echo(echo: &Echo) -> Self {
        Self {
            session_id: echo.session_id.clone(),
            cascade_id: echo.cascade_id.clone(),
            status: echo.status(),
            outputs: echo.outputs.clone(),
            state: echo.state.clone(),
            errors: echo.errors.clone(),
            usage: echo.usage,
        }
    }

    /// Output of the final cell that produced one, as JSON.
    pub fn final_output(&self) -> Value {
        self.outputs
            .values()
            .next_back()
            .cloned()
            .unwrap_or(Value::Null)
    }
}
