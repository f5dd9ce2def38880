//! Manifest mode: runtime tool auto-selection for cells declaring
//! `traits: manifest`.
//!
//! Two-stage filter: an embedding prefilter narrows the full registry to ~30
//! candidates, then an LLM picks the shortlist that actually fits the cell's
//! instructions. Without a configured embedding backend, a hashed
//! bag-of-words embedder stands in; the cosine scores are rough but cheap.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use rvbbit_core::{Message, Result, Tool};
use rvbbit_providers::{ChatModel, ChatRequest};

use crate::SkillRegistry;

/// Prefilter size before the LLM pick.
const PREFILTER_LIMIT: usize = 30;
/// Fallback shortlist size when the LLM pick fails to parse.
const FALLBACK_LIMIT: usize = 5;

/// Text embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Hashed bag-of-words embedding; a stand-in for a real embedding backend.
pub struct LexicalEmbedder {
    dims: usize,
}

impl LexicalEmbedder {
    pub fn new() -> Self {
        Self { dims: 256 }
    }
}

impl Default for LexicalEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for LexicalEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0f32; self.dims];
                for token in text
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|t| t.len() > 2)
                {
                    let mut h: u64 = 1469598103934665603;
                    for b in token.bytes() {
                        h ^= b as u64;
                        h = h.wrapping_mul(1099511628211);
                    }
                    v[(h % self.dims as u64) as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Select tools for a manifest-mode cell.
///
/// Returns at most `limit` tools ranked by relevance to `instructions`.
pub async fn manifest_select(
    registry: &SkillRegistry,
    instructions: &str,
    model: &dyn ChatModel,
    embedder: &dyn Embedder,
    limit: usize,
) -> Result<Vec<Arc<dyn Tool>>> {
    let skills = registry.list(None);
    if skills.is_empty() {
        return Ok(Vec::new());
    }

    // Stage 1: embedding prefilter.
    let mut texts = vec![instructions.to_string()];
    texts.extend(
        skills
            .iter()
            .map(|s| format!("{}: {}", s.name, s.description)),
    );
    let vectors = embedder.embed(&texts).await?;
    let query = &vectors[0];

    let mut scored: Vec<(f32, &crate::SkillInfo)> = skills
        .iter()
        .zip(&vectors[1..])
        .map(|(skill, vec)| (cosine(query, vec), skill))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let candidates: Vec<&crate::SkillInfo> = scored
        .iter()
        .take(PREFILTER_LIMIT)
        .map(|(_, s)| *s)
        .collect();

    // Stage 2: LLM pick.
    let catalog: String = candidates
        .iter()
        .map(|s| format!("- {}: {}\n", s.name, s.description))
        .collect();
    let prompt = format!(
        "A workflow step has these instructions:\n\n{instructions}\n\n\
         Available tools:\n{catalog}\n\
         Reply with a JSON array of the tool names (at most {limit}) this step needs. \
         Reply with [] if none apply."
    );
    let response = model
        .generate(ChatRequest::new(vec![
            Message::system("You select tools for workflow steps. Reply with only a JSON array."),
            Message::user(prompt),
        ]))
        .await?;

    let picked = parse_name_array(&response.content);
    let names: Vec<String> = match picked {
        Some(names) if !names.is_empty() => names
            .into_iter()
            .filter(|n| candidates.iter().any(|c| &c.name == n))
            .take(limit)
            .collect(),
        _ => {
            tracing::warn!("manifest pick unparseable; falling back to prefilter ranking");
            candidates
                .iter()
                .take(FALLBACK_LIMIT.min(limit))
                .map(|c| c.name.clone())
                .collect()
        }
    };

    let mut tools = Vec::with_capacity(names.len());
    for name in names {
        if let Ok(tool) = registry.get(&name) {
            tools.push(tool);
        }
    }
    Ok(tools)
}

/// Extract a JSON string array from model output, tolerating fencing and
/// surrounding prose.
fn parse_name_array(content: &str) -> Option<Vec<String>> {
    let trimmed = content.trim();
    let candidate = if let Some(start) = trimmed.find('[') {
        let end = trimmed.rfind(']')?;
        &trimmed[start..=end]
    } else {
        trimmed
    };
    let value: Value = serde_json::from_str(candidate).ok()?;
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::register_builtins;
    use rvbbit_providers::MockChatModel;

    #[tokio::test]
    async fn lexical_embedder_scores_overlap_higher() {
        let e = LexicalEmbedder::new();
        let vecs = e
            .embed(&[
                "fetch a url over http".to_string(),
                "http_get: HTTP GET a URL and return the response body".to_string(),
                "uppercase: Uppercase the text argument".to_string(),
            ])
            .await
            .unwrap();
        let http = cosine(&vecs[0], &vecs[1]);
        let upper = cosine(&vecs[0], &vecs[2]);
        assert!(http > upper, "http tool should outrank uppercase");
    }

    #[tokio::test]
    async fn llm_pick_filters_to_known_names() {
        let registry = SkillRegistry::new();
        register_builtins(&registry);
        let model = MockChatModel::new();
        model.push_text(r#"["http_get", "imaginary_tool"]"#);

        let tools = manifest_select(
            &registry,
            "download a web page",
            &model,
            &LexicalEmbedder::new(),
            4,
        )
        .await
        .unwrap();

        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["http_get"]);
    }

    #[tokio::test]
    async fn unparseable_pick_falls_back_to_ranking() {
        let registry = SkillRegistry::new();
        register_builtins(&registry);
        let model = MockChatModel::new();
        model.push_text("I think you should use the shell tool, probably.");

        let tools = manifest_select(
            &registry,
            "run a shell command",
            &model,
            &LexicalEmbedder::new(),
            3,
        )
        .await
        .unwrap();
        assert!(!tools.is_empty());
        assert!(tools.len() <= 3);
    }

    #[test]
    fn name_array_parsing_tolerates_fences() {
        assert_eq!(
            parse_name_array("```json\n[\"a\", \"b\"]\n```").unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(parse_name_array("[]").unwrap(), Vec::<String>::new());
        assert!(parse_name_array("no json at all").is_none());
    }
}
