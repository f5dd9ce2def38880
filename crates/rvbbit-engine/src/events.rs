//! Event emission helpers: a scope pre-filled with the identifiers every
//! event of one cell shares.

use rvbbit_events::{Event, EventLog, NodeKind};

/// Pre-filled event factory for one (session, cascade, cell) context.
#[derive(Clone)]
pub struct EventScope {
    pub log: EventLog,
    pub session_id: String,
    pub cascade_id: String,
    pub caller_id: String,
    pub cell_name: String,
    pub depth: u32,
    pub parent_trace_id: Option<String>,
}

impl EventScope {
    pub fn new(
        log: EventLog,
        session_id: impl Into<String>,
        cascade_id: impl Into<String>,
        caller_id: impl Into<String>,
        depth: u32,
    ) -> Self {
        Self {
            log,
            session_id: session_id.into(),
            cascade_id: cascade_id.into(),
            caller_id: caller_id.into(),
            cell_name: String::new(),
            depth,
            parent_trace_id: None,
        }
    }

    /// Scope narrowed to one cell.
    pub fn for_cell(&self, cell_name: impl Into<String>) -> Self {
        let mut scope = self.clone();
        scope.cell_name = cell_name.into();
        scope
    }

    /// Scope with a parent trace id for hierarchical chains.
    pub fn with_parent_trace(&self, trace_id: impl Into<String>) -> Self {
        let mut scope = self.clone();
        scope.parent_trace_id = Some(trace_id.into());
        scope
    }

    /// New event carrying the scope's identifiers.
    pub fn event(&self, kind: NodeKind) -> Event {
        let mut event = Event::new(
            kind,
            self.session_id.clone(),
            self.cascade_id.clone(),
            self.caller_id.clone(),
        )
        .with_depth(self.depth);
        if !self.cell_name.is_empty() {
            event = event.with_cell(self.cell_name.clone());
        }
        if let Some(parent) = &self.parent_trace_id {
            event = event.with_parent(parent.clone());
        }
        event
    }

    /// Build and log in one step; returns the trace id.
    pub fn emit(&self, kind: NodeKind, content: serde_json::Value) -> String {
        let event = self.event(kind).with_content(content);
        let trace = event.trace_id.clone();
        self.log.log(event);
        trace
    }

    pub fn emit_event(&self, event: Event) -> String {
        let trace = event.trace_id.clone();
        self.log.log(event);
        trace
    }

    /// Error event with a structured diagnostic payload.
    pub fn emit_error(&self, error: &rvbbit_core::Error) -> String {
        self.emit(
            NodeKind::Error,
            serde_json::json!({ "error": error.to_string() }),
        )
    }
}
