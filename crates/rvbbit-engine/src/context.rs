//! Context assembly: build the message list a cell's agent loop starts with.
//!
//! Assembly order: global system preface, rendered cell instructions, then
//! prior-cell messages filtered by the cell's retention mode and TTL map.

use std::collections::HashSet;

use serde_json::Value;

use rvbbit_budget::TokenBudgeter;
use rvbbit_core::config::{CascadeDef, Cell, ContextSpec, Retention, SelectionStrategy};
use rvbbit_core::template::render;
use rvbbit_core::{Message, Result, Role};

use crate::echo::{CellRecord, Echo};

/// Build the starting message list for `cell`, which will run as the
/// `current_index`-th cell of the cascade.
pub fn build_context(
    def: &CascadeDef,
    cell: &Cell,
    echo: &Echo,
    current_index: usize,
    budgeter: Option<&TokenBudgeter>,
) -> Result<Vec<Message>> {
    let mut messages = vec![Message::system(preface(def, cell))];

    if let Some(instructions) = &cell.instructions {
        let rendered = render(instructions, &echo.scope())?;
        messages.push(Message::user(rendered));
    }

    let spec = cell.context.clone().unwrap_or_default();
    let prior = retained_messages(&spec, &echo.records, current_index, &messages, budgeter);
    messages.extend(prior);

    Ok(messages)
}

/// Global system preface: workflow identity plus the declared input surface.
fn preface(def: &CascadeDef, cell: &Cell) -> String {
    let mut out = format!(
        "You are executing step '{}' of the workflow '{}'.",
        cell.name, def.cascade_id
    );
    if !def.description.is_empty() {
        out.push(' ');
        out.push_str(&def.description);
    }
    if !def.inputs_schema.is_empty() {
        out.push_str("\nWorkflow inputs:");
        for (name, spec) in &def.inputs_schema {
            let ty = if spec.type_name.is_empty() {
                "string"
            } else {
                &spec.type_name
            };
            out.push_str(&format!("\n- {name} ({ty}): {}", spec.description));
        }
    }
    out
}

fn retained_messages(
    spec: &ContextSpec,
    records: &[CellRecord],
    current_index: usize,
    head: &[Message],
    budgeter: Option<&TokenBudgeter>,
) -> Vec<Message> {
    let candidates: Vec<(usize, Message)> = match spec.retention {
        Retention::None => Vec::new(),
        Retention::Full => records
            .iter()
            .flat_map(|r| r.messages.iter().map(move |m| (r.index, m.clone())))
            .collect(),
        Retention::OutputOnly => records
            .iter()
            .filter(|r| !r.final_output.is_empty())
            .map(|r| {
                (
                    r.index,
                    Message::assistant(format!("[{}] {}", r.cell_name, r.final_output)),
                )
            })
            .collect(),
        Retention::Auto => {
            let instructions = head
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or("");
            return auto_select(spec, records, current_index, instructions, budgeter);
        }
    };

    apply_ttl(spec, candidates, current_index)
}

/// Drop messages whose kind has aged past the cell's TTL (measured in
/// intervening cells).
fn apply_ttl(
    spec: &ContextSpec,
    candidates: Vec<(usize, Message)>,
    current_index: usize,
) -> Vec<Message> {
    candidates
        .into_iter()
        .filter(|(origin_index, message)| {
            let Some(ttl) = spec.ttl.get(message_kind(message)) else {
                return true;
            };
            let age = current_index.saturating_sub(*origin_index) as u32;
            age <= *ttl
        })
        .map(|(_, m)| m)
        .collect()
}

fn message_kind(message: &Message) -> &'static str {
    match message.role {
        Role::System => "system",
        Role::User => "user_msg",
        Role::Assistant => "agent_msg",
        Role::Tool => "tool_result",
    }
}

/// `retention: auto` — rank prior messages by the configured strategy and
/// keep the best that fit in `max_tokens`.
fn auto_select(
    spec: &ContextSpec,
    records: &[CellRecord],
    current_index: usize,
    instructions: &str,
    budgeter: Option<&TokenBudgeter>,
) -> Vec<Message> {
    let selection = spec.selection.clone().unwrap_or(
        rvbbit_core::config::SelectionSpec {
            strategy: SelectionStrategy::Heuristic,
            max_tokens: 4096,
        },
    );

    let candidates: Vec<(usize, Message)> = records
        .iter()
        .flat_map(|r| r.messages.iter().map(move |m| (r.index, m.clone())))
        .filter(|(_, m)| m.role != Role::System)
        .collect();
    let candidates = apply_ttl(spec, candidates, current_index);

    let instruction_terms = terms(instructions);
    let mut scored: Vec<(f64, usize, Message)> = candidates
        .into_iter()
        .enumerate()
        .map(|(seq, message)| {
            let recency = 1.0 / (1.0 + (current_index as f64) - position_weight(seq));
            let semantic = overlap(&instruction_terms, &message.content);
            let score = match selection.strategy {
                SelectionStrategy::Heuristic => recency,
                SelectionStrategy::Semantic => semantic,
                SelectionStrategy::Hybrid => (recency + semantic) / 2.0,
            };
            (score, seq, message)
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let count = |m: &Message| -> usize {
        match budgeter {
            Some(b) => b.count_text(&m.content) + 4,
            None => m.content.len() / 4 + 4,
        }
    };

    let mut kept: Vec<(usize, Message)> = Vec::new();
    let mut used = 0usize;
    for (_, seq, message) in scored {
        let tokens = count(&message);
        if used + tokens > selection.max_tokens {
            continue;
        }
        used += tokens;
        kept.push((seq, message));
    }
    // Restore chronological order.
    kept.sort_by_key(|(seq, _)| *seq);
    kept.into_iter().map(|(_, m)| m).collect()
}

fn position_weight(seq: usize) -> f64 {
    seq as f64 * 0.01
}

fn terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3)
        .map(str::to_string)
        .collect()
}

fn overlap(instruction_terms: &HashSet<String>, content: &str) -> f64 {
    if instruction_terms.is_empty() {
        return 0.0;
    }
    let content_terms = terms(content);
    let shared = instruction_terms.intersection(&content_terms).count();
    shared as f64 / instruction_terms.len() as f64
}

/// Summarize a tool/cell output value into the text stored as a record's
/// final output.
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvbbit_core::config::parse_cascade;
    use serde_json::json;

    fn fixture() -> (CascadeDef, Echo) {
        let def = parse_cascade(
            r#"
cascade_id: ctx_test
description: "Testing context assembly"
inputs_schema:
  topic:
    type: string
    description: "what to write about"
cells:
  - name: first
    kind: agent
    instructions: "write about {{ inputs.topic }}"
  - name: second
    kind: agent
    instructions: "refine the draft"
"#,
        )
        .unwrap();
        let mut echo = Echo::new(
            "ctx_test",
            json!({"topic": "geese"}),
            None,
            Default::default(),
            0,
            None,
        );
        echo.records.push(CellRecord {
            index: 0,
            cell_name: "first".into(),
            messages: vec![
                Message::user("write about geese"),
                Message::assistant("geese are loud"),
                Message::tool_result("c1", "echo", "tool noise"),
            ],
            final_output: "geese are loud".into(),
        });
        (def, echo)
    }

    #[test]
    fn preface_and_instructions_lead() {
        let (def, echo) = fixture();
        let cell = &def.cells[1];
        let messages = build_context(&def, cell, &echo, 1, None).unwrap();
        assert!(messages[0].is_system());
        assert!(messages[0].content.contains("ctx_test"));
        assert!(messages[0].content.contains("topic"));
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, "refine the draft");
    }

    #[test]
    fn full_retention_includes_prior_messages() {
        let (def, echo) = fixture();
        let cell = &def.cells[1];
        let messages = build_context(&def, cell, &echo, 1, None).unwrap();
        assert!(messages.iter().any(|m| m.content == "geese are loud"));
        assert!(messages.iter().any(|m| m.content == "tool noise"));
    }

    #[test]
    fn output_only_retention_collapses_cells() {
        let (def, mut echo) = fixture();
        let mut cell = def.cells[1].clone();
        cell.context = Some(ContextSpec {
            retention: Retention::OutputOnly,
            ..Default::default()
        });
        echo.records.push(CellRecord {
            index: 1,
            cell_name: "middle".into(),
            messages: vec![Message::assistant("intermediate")],
            final_output: "intermediate".into(),
        });
        let messages = build_context(&def, &cell, &echo, 2, None).unwrap();
        let outputs: Vec<&Message> = messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .collect();
        assert_eq!(outputs.len(), 2);
        assert!(outputs[0].content.contains("[first]"));
        assert!(!messages.iter().any(|m| m.content == "tool noise"));
    }

    #[test]
    fn none_retention_drops_history() {
        let (def, echo) = fixture();
        let mut cell = def.cells[1].clone();
        cell.context = Some(ContextSpec {
            retention: Retention::None,
            ..Default::default()
        });
        let messages = build_context(&def, &cell, &echo, 1, None).unwrap();
        assert_eq!(messages.len(), 2); // preface + instructions
    }

    #[test]
    fn ttl_drops_aged_kinds() {
        let (def, echo) = fixture();
        let mut cell = def.cells[1].clone();
        let mut ttl = std::collections::BTreeMap::new();
        ttl.insert("tool_result".to_string(), 0u32);
        cell.context = Some(ContextSpec {
            retention: Retention::Full,
            ttl,
            selection: None,
        });
        // Age 2 > ttl 0: tool results vanish, agent messages stay.
        let messages = build_context(&def, &cell, &echo, 2, None).unwrap();
        assert!(!messages.iter().any(|m| m.content == "tool noise"));
        assert!(messages.iter().any(|m| m.content == "geese are loud"));
    }

    #[test]
    fn auto_retention_respects_token_cap() {
        let (def, mut echo) = fixture();
        for i in 0..50 {
            echo.records.push(CellRecord {
                index: 1,
                cell_name: format!("filler{i}"),
                messages: vec![Message::assistant(format!(
                    "filler message {i} with plenty of words to occupy budget space"
                ))],
                final_output: String::new(),
            });
        }
        let mut cell = def.cells[1].clone();
        cell.context = Some(ContextSpec {
            retention: Retention::Auto,
            ttl: Default::default(),
            selection: Some(rvbbit_core::config::SelectionSpec {
                strategy: SelectionStrategy::Hybrid,
                max_tokens: 100,
            }),
        });
        let messages = build_context(&def, &cell, &echo, 2, None).unwrap();
        let history: Vec<&Message> = messages.iter().skip(2).collect();
        assert!(!history.is_empty());
        let approx: usize = history.iter().map(|m| m.content.len() / 4 + 4).sum();
        assert!(approx <= 120, "auto retention must respect max_tokens");
    }

    #[test]
    fn value_as_text_forms() {
        assert_eq!(value_as_text(&json!("plain")), "plain");
        assert_eq!(value_as_text(&json!({"a": 1})), "{\"a\":1}");
        assert_eq!(value_as_text(&Value::Null), "");
    }
}
