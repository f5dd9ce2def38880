//! Pluggable vector search backend behind the `RVBBIT EMBED` statement and
//! the `vector_search_json` UDF.
//!
//! The in-memory store is the default backend; real vector databases
//! implement [`VectorStore`] and slot in through the same interface.

use dashmap::DashMap;
use serde_json::{json, Value};

use rvbbit_core::Result;

/// One embedded row.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: Value,
}

/// Vector backend contract: upsert embedded rows into a namespace
/// (`table.column`) and search by vector similarity.
pub trait VectorStore: Send + Sync {
    fn upsert(&self, namespace: &str, entry: VectorEntry) -> Result<()>;
    fn search(&self, namespace: &str, query: &[f32], k: usize, min_score: f64)
        -> Result<Vec<(f64, VectorEntry)>>;
    fn count(&self, namespace: &str) -> usize;
}

/// In-memory vector store keyed by namespace.
#[derive(Default)]
pub struct InMemoryVectorStore {
    namespaces: DashMap<String, Vec<VectorEntry>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorStore for InMemoryVectorStore {
    fn upsert(&self, namespace: &str, entry: VectorEntry) -> Result<()> {
        let mut entries = self.namespaces.entry(namespace.to_string()).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.id == entry.id) {
            *existing = entry;
        } else {
            entries.push(entry);
        }
        Ok(())
    }

    fn search(
        &self,
        namespace: &str,
        query: &[f32],
        k: usize,
        min_score: f64,
    ) -> Result<Vec<(f64, VectorEntry)>> {
        let Some(entries) = self.namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(f64, VectorEntry)> = entries
            .iter()
            .map(|e| (cosine(query, &e.vector) as f64, e.clone()))
            .filter(|(score, _)| *score >= min_score)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn count(&self, namespace: &str) -> usize {
        self.namespaces
            .get(namespace)
            .map(|e| e.len())
            .unwrap_or(0)
    }
}

/// Hashed bag-of-words embedding, the stand-in used when no embedding
/// backend is configured. Must stay in sync with the manifest prefilter's
/// notion of similarity.
pub fn lexical_vector(text: &str) -> Vec<f32> {
    const DIMS: usize = 256;
    let mut v = vec![0f32; DIMS];
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
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    v
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

/// Search result rendered as the JSON the `vector_search_json` UDF returns.
pub fn search_results_json(results: &[(f64, VectorEntry)]) -> Value {
    Value::Array(
        results
            .iter()
            .map(|(score, entry)| {
                json!({
                    "id": entry.id,
                    "text": entry.text,
                    "score": score,
                    "metadata": entry.metadata,
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, text: &str) -> VectorEntry {
        VectorEntry {
            id: id.to_string(),
            text: text.to_string(),
            vector: lexical_vector(text),
            metadata: json!({ "column_name": "body" }),
        }
    }

    #[test]
    fn upsert_and_search_rank_by_similarity() {
        let store = InMemoryVectorStore::new();
        store.upsert("docs.body", entry("1", "rust borrow checker tips")).unwrap();
        store.upsert("docs.body", entry("2", "gardening in spring")).unwrap();
        store.upsert("docs.body", entry("3", "advanced rust lifetimes")).unwrap();

        let query = lexical_vector("rust lifetimes");
        let results = store.search("docs.body", &query, 2, 0.0).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1.id, "3");
    }

    #[test]
    fn upsert_replaces_same_id() {
        let store = InMemoryVectorStore::new();
        store.upsert("ns", entry("1", "old text")).unwrap();
        store.upsert("ns", entry("1", "new text")).unwrap();
        assert_eq!(store.count("ns"), 1);
    }

    #[test]
    fn min_score_filters() {
        let store = InMemoryVectorStore::new();
        store.upsert("ns", entry("1", "completely unrelated words")).unwrap();
        let query = lexical_vector("rust compiler");
        let results = store.search("ns", &query, 10, 0.9).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn results_json_shape() {
        let results = vec![(0.9, entry("1", "hello"))];
        let json = search_results_json(&results);
        assert_eq!(json[0]["id"], "1");
        assert_eq!(json[0]["metadata"]["column_name"], "body");
    }
}
