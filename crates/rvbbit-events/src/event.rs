//! The event row: one immutable record of something that happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of node produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    CascadeStart,
    CascadeComplete,
    CellStart,
    CellComplete,
    AgentMsg,
    ToolCall,
    ToolResult,
    CandidateComplete,
    Selection,
    Warning,
    Error,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::CascadeStart => "cascade_start",
            NodeKind::CascadeComplete => "cascade_complete",
            NodeKind::CellStart => "cell_start",
            NodeKind::CellComplete => "cell_complete",
            NodeKind::AgentMsg => "agent_msg",
            NodeKind::ToolCall => "tool_call",
            NodeKind::ToolResult => "tool_result",
            NodeKind::CandidateComplete => "candidate_complete",
            NodeKind::Selection => "selection",
            NodeKind::Warning => "warning",
            NodeKind::Error => "error",
        }
    }
}

/// One append-only log row. `trace_id` is a ULID, globally unique; the
/// `parent_trace_id` chain is acyclic by construction (children are created
/// after their parents and reference them one way).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
    pub caller_id: String,
    pub node_kind: NodeKind,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub cell_name: String,
    #[serde(default)]
    pub cascade_id: String,
    #[serde(default)]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_winner: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reforge_step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub tool_calls: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub has_images: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_paths: Vec<String>,
}

impl Event {
    pub fn new(
        node_kind: NodeKind,
        session_id: impl Into<String>,
        cascade_id: impl Into<String>,
        caller_id: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            trace_id: rvbbit_core::ids::new_trace_id(),
            parent_trace_id: None,
            caller_id: caller_id.into(),
            node_kind,
            role: String::new(),
            cell_name: String::new(),
            cascade_id: cascade_id.into(),
            depth: 0,
            candidate_index: None,
            is_winner: None,
            reforge_step: None,
            duration_ms: None,
            tokens_in: None,
            tokens_out: None,
            cost: None,
            content: serde_json::Value::Null,
            tool_calls: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            has_images: false,
            image_paths: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent_trace_id: impl Into<String>) -> Self {
        self.parent_trace_id = Some(parent_trace_id.into());
        self
    }

    pub fn with_cell(mut self, cell_name: impl Into<String>) -> Self {
        self.cell_name = cell_name.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: serde_json::Value) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_candidate(mut self, index: u32) -> Self {
        self.candidate_index = Some(index);
        self
    }

    pub fn with_winner(mut self, is_winner: bool) -> Self {
        self.is_winner = Some(is_winner);
        self
    }

    pub fn with_reforge_step(mut self, step: u32) -> Self {
        self.reforge_step = Some(step);
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64, cost: Option<f64>) -> Self {
        self.tokens_in = Some(tokens_in);
        self.tokens_out = Some(tokens_out);
        self.cost = cost;
        self
    }

    /// Error events are never dropped by the overflow policy.
    pub fn is_critical(&self) -> bool {
        self.node_kind == NodeKind::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let ev = Event::new(NodeKind::CellStart, "s1", "casc", "caller")
            .with_cell("gen")
            .with_depth(2)
            .with_candidate(1)
            .with_winner(true)
            .with_reforge_step(1)
            .with_usage(100, 20, Some(0.003));
        assert_eq!(ev.cell_name, "gen");
        assert_eq!(ev.depth, 2);
        assert_eq!(ev.candidate_index, Some(1));
        assert_eq!(ev.is_winner, Some(true));
        assert_eq!(ev.tokens_in, Some(100));
        assert!(!ev.is_critical());
        assert!(Event::new(NodeKind::Error, "s", "c", "x").is_critical());
    }

    #[test]
    fn node_kind_serde() {
        assert_eq!(
            serde_json::to_string(&NodeKind::CandidateComplete).unwrap(),
            "\"candidate_complete\""
        );
        let k: NodeKind = serde_json::from_str("\"cascade_start\"").unwrap();
        assert_eq!(k, NodeKind::CascadeStart);
    }

    #[test]
    fn jsonl_round_trip() {
        let ev = Event::new(NodeKind::AgentMsg, "s1", "casc", "caller")
            .with_content(serde_json::json!({"text": "hello"}));
        let line = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back.session_id, "s1");
        assert_eq!(back.trace_id, ev.trace_id);
        assert_eq!(back.content["text"], "hello");
    }
}
