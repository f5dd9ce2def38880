//! Output extraction: regex scans over a cell's final assistant content,
//! parsed per declared format and stored into run state.

use regex::Regex;
use serde_json::{Map, Value};

use rvbbit_core::config::{ExtractFormat, ExtractionSpec};
use rvbbit_core::{Error, Result};

/// Apply every extraction spec to `content`, writing matches into `state`.
///
/// A `required` spec that does not match fails the cell. Two required specs
/// that both match but disagree on the value for one `store_as` key also
/// fail: precedence between conflicting required extractions is undefined,
/// so the engine refuses to pick silently.
pub fn apply_extractions(
    specs: &[ExtractionSpec],
    content: &str,
    state: &mut Map<String, Value>,
) -> Result<()> {
    let mut written: Map<String, Value> = Map::new();
    let mut required_keys: Vec<String> = Vec::new();

    for spec in specs {
        let re = Regex::new(&spec.pattern).map_err(|e| Error::Extraction {
            name: spec.store_as.clone(),
            message: format!("invalid pattern: {e}"),
        })?;

        let captured = re.captures(content).map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        });

        let Some(raw) = captured else {
            if spec.required {
                return Err(Error::Extraction {
                    name: spec.store_as.clone(),
                    message: format!("required pattern {:?} did not match", spec.pattern),
                });
            }
            continue;
        };

        let value = parse_format(&raw, spec.format).map_err(|message| Error::Extraction {
            name: spec.store_as.clone(),
            message,
        })?;

        if let Some(previous) = written.get(&spec.store_as) {
            let conflicting = previous != &value;
            let both_required = spec.required && required_keys.contains(&spec.store_as);
            if conflicting && both_required {
                return Err(Error::Extraction {
                    name: spec.store_as.clone(),
                    message: format!(
                        "two required extractions produced conflicting values for '{}'",
                        spec.store_as
                    ),
                });
            }
            if conflicting && !spec.required {
                // Optional extraction never overrides an existing value.
                continue;
            }
        }

        written.insert(spec.store_as.clone(), value);
        if spec.required {
            required_keys.push(spec.store_as.clone());
        }
    }

    for (key, value) in written {
        state.insert(key, value);
    }
    Ok(())
}

fn parse_format(raw: &str, format: ExtractFormat) -> std::result::Result<Value, String> {
    match format {
        ExtractFormat::Text => Ok(Value::String(raw.to_string())),
        ExtractFormat::Json => {
            let stripped = strip_fences(raw);
            serde_json::from_str(stripped.trim())
                .map_err(|e| format!("extracted text is not valid JSON: {e}"))
        }
        ExtractFormat::Code => Ok(Value::String(strip_fences(raw).trim().to_string())),
    }
}

/// Remove a surrounding fenced code block, if present.
fn strip_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = match rest.find('\n') {
            Some(i) => &rest[i + 1..],
            None => rest,
        };
        if let Some(body) = rest.strip_suffix("```") {
            return body.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(store_as: &str, pattern: &str, format: ExtractFormat, required: bool) -> ExtractionSpec {
        ExtractionSpec {
            store_as: store_as.into(),
            pattern: pattern.into(),
            format,
            required,
        }
    }

    #[test]
    fn text_extraction_uses_first_capture_group() {
        let mut state = Map::new();
        apply_extractions(
            &[spec("answer", r"ANSWER:\s*(\w+)", ExtractFormat::Text, true)],
            "Thinking... ANSWER: yes",
            &mut state,
        )
        .unwrap();
        assert_eq!(state["answer"], json!("yes"));
    }

    #[test]
    fn required_miss_fails() {
        let mut state = Map::new();
        let err = apply_extractions(
            &[spec("answer", r"ANSWER:\s*(\w+)", ExtractFormat::Text, true)],
            "no marker here",
            &mut state,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Extraction { .. }));
    }

    #[test]
    fn optional_miss_is_fine() {
        let mut state = Map::new();
        apply_extractions(
            &[spec("answer", r"ANSWER:\s*(\w+)", ExtractFormat::Text, false)],
            "no marker here",
            &mut state,
        )
        .unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn json_extraction_parses_object() {
        let mut state = Map::new();
        apply_extractions(
            &[spec(
                "result",
                r"(?s)```json\n(.*?)\n```",
                ExtractFormat::Json,
                true,
            )],
            "Result:\n```json\n{\"score\": 7}\n```",
            &mut state,
        )
        .unwrap();
        assert_eq!(state["result"], json!({"score": 7}));
    }

    #[test]
    fn code_extraction_strips_fences() {
        let mut state = Map::new();
        apply_extractions(
            &[spec(
                "snippet",
                r"(?s)(```python\n.*?```)",
                ExtractFormat::Code,
                true,
            )],
            "Here:\n```python\nprint('hi')\n```",
            &mut state,
        )
        .unwrap();
        assert_eq!(state["snippet"], json!("print('hi')"));
    }

    #[test]
    fn conflicting_required_extractions_fail_fast() {
        let mut state = Map::new();
        let err = apply_extractions(
            &[
                spec("verdict", r"FIRST:\s*(\w+)", ExtractFormat::Text, true),
                spec("verdict", r"SECOND:\s*(\w+)", ExtractFormat::Text, true),
            ],
            "FIRST: yes SECOND: no",
            &mut state,
        )
        .unwrap_err();
        assert!(err.to_string().contains("conflicting"));
    }

    #[test]
    fn agreeing_required_extractions_pass() {
        let mut state = Map::new();
        apply_extractions(
            &[
                spec("verdict", r"FIRST:\s*(\w+)", ExtractFormat::Text, true),
                spec("verdict", r"SECOND:\s*(\w+)", ExtractFormat::Text, true),
            ],
            "FIRST: yes SECOND: yes",
            &mut state,
        )
        .unwrap();
        assert_eq!(state["verdict"], json!("yes"));
    }
}
