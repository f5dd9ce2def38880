//! Template rendering for cell instructions, candidate factors, and tool
//! input templates.
//!
//! Templates see three namespaces: `inputs.*` (cascade inputs), `state.*`
//! (mutable run state), and `outputs.<cell>` (prior cell results).

use serde_json::Value;
use tera::Tera;

use crate::error::{Error, Result};

/// The variable namespaces visible to a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateScope {
    pub inputs: Value,
    pub state: Value,
    pub outputs: Value,
}

impl TemplateScope {
    pub fn new(inputs: Value, state: Value, outputs: Value) -> Self {
        Self {
            inputs,
            state,
            outputs,
        }
    }

    fn to_context(&self) -> Result<tera::Context> {
        let mut ctx = tera::Context::new();
        ctx.insert("inputs", &self.inputs);
        ctx.insert("state", &self.state);
        ctx.insert("outputs", &self.outputs);
        Ok(ctx)
    }
}

/// Render a template string against the scope.
pub fn render(template: &str, scope: &TemplateScope) -> Result<String> {
    // Fast path: nothing to interpolate.
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }
    let ctx = scope.to_context()?;
    Tera::one_off(template, &ctx, false).map_err(|e| Error::Template(flatten_tera(&e)))
}

/// Render every string leaf of a JSON value in place. Used for per-cell
/// `inputs` maps where values like `"{{ outputs.a.msg }}"` appear nested.
pub fn render_json(value: &Value, scope: &TemplateScope) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(render(s, scope)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_json(v, scope))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_json(v, scope)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// Resolve a candidate `factor` that may be a template. The rendered result
/// must parse as a positive integer; a rendered JSON array resolves to its
/// length.
pub fn resolve_factor(template: &str, scope: &TemplateScope) -> Result<usize> {
    let rendered = render(template, scope)?;
    let trimmed = rendered.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        if n <= 0 {
            return Err(Error::config(
                "candidates.factor",
                format!("factor must resolve to a positive integer, got {n}"),
            ));
        }
        return Ok(n as usize);
    }
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
        if items.is_empty() {
            return Err(Error::config(
                "candidates.factor",
                "factor template resolved to an empty list",
            ));
        }
        return Ok(items.len());
    }
    Err(Error::config(
        "candidates.factor",
        format!("factor template resolved to non-numeric value: {trimmed:?}"),
    ))
}

fn flatten_tera(e: &tera::Error) -> String {
    use std::error::Error as _;
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> TemplateScope {
        TemplateScope::new(
            json!({"topic": "geese"}),
            json!({"count": 3}),
            json!({"a": {"msg": "hi"}}),
        )
    }

    #[test]
    fn renders_all_namespaces() {
        let s = scope();
        assert_eq!(render("about {{ inputs.topic }}", &s).unwrap(), "about geese");
        assert_eq!(render("{{ state.count }}", &s).unwrap(), "3");
        assert_eq!(render("{{ outputs.a.msg }}", &s).unwrap(), "hi");
    }

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(render("no templates here", &scope()).unwrap(), "no templates here");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let err = render("{{ outputs.missing.x }}", &scope()).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn render_json_walks_nesting() {
        let v = json!({"text": "{{ outputs.a.msg }}", "n": 1, "list": ["{{ state.count }}"]});
        let out = render_json(&v, &scope()).unwrap();
        assert_eq!(out, json!({"text": "hi", "n": 1, "list": ["3"]}));
    }

    #[test]
    fn factor_literal_and_template() {
        let s = scope();
        assert_eq!(resolve_factor("4", &s).unwrap(), 4);
        assert_eq!(resolve_factor("{{ state.count }}", &s).unwrap(), 3);
        assert!(resolve_factor("0", &s).is_err());
        assert!(resolve_factor("-2", &s).is_err());
        assert!(resolve_factor("banana", &s).is_err());
    }

    #[test]
    fn factor_from_rendered_list_length() {
        let s = TemplateScope::new(json!({}), json!({"items": [1, 2, 3, 4]}), json!({}));
        // tera renders arrays as JSON-ish lists; resolve via parsed length
        let n = resolve_factor("[9, 9]", &s).unwrap();
        assert_eq!(n, 2);
    }
}
