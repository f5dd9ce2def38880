//! The LLM UDF bridge: OLAP-registered functions whose body re-enters the
//! cascade scheduler.
//!
//! Every semantic scalar is cache-first: the fingerprint of (function, args)
//! is looked up before any dispatch, and in-flight coalescing in the cache
//! guarantees that 10k identical rows on a cold cache cost one LLM call, not
//! 10k. A global semaphore bounds concurrent dispatches across the process.
//!
//! UDF callbacks run on the OLAP worker thread, so they may block on the
//! async scheduler via a captured runtime handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use rvbbit_cache::canonical_json;
use rvbbit_core::caller::CallerContext;
use rvbbit_core::config::{parse_cascade, CascadeDef};
use rvbbit_core::tools::CachePolicy;
use rvbbit_core::{env_vars, Error, Result};
use rvbbit_engine::{current_depth, CascadeStatus, Scheduler, SpawnLink};

use crate::olap::OlapEngine;

/// Default TTL for semantic UDF results.
const SEMANTIC_TTL_SECS: u64 = 24 * 3600;

/// The builtin semantic scalar functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticFn {
    Matches,
    About,
    Extract,
    Fuzzy,
    Implies,
    /// `rvbbit_udf(instruction, input)`: follow-this-instruction.
    Generic,
}

impl SemanticFn {
    pub fn name(&self) -> &'static str {
        match self {
            SemanticFn::Matches => "semantic_matches",
            SemanticFn::About => "semantic_about",
            SemanticFn::Extract => "semantic_extract",
            SemanticFn::Fuzzy => "semantic_fuzzy",
            SemanticFn::Implies => "semantic_implies",
            SemanticFn::Generic => "rvbbit_udf",
        }
    }

    fn arity(&self) -> i32 {
        2
    }

    /// The mini-cascade executing this function.
    fn cascade_yaml(&self) -> &'static str {
        match self {
            SemanticFn::Matches => {
                r#"
cascade_id: _udf_semantic_matches
cells:
  - name: judge
    kind: agent
    instructions: |
      Text: {{ inputs.text }}
      Criterion: {{ inputs.criterion }}
      Does the text satisfy the criterion? Reply with exactly
      ANSWER: true or ANSWER: false.
    output_extraction:
      - store_as: answer
        pattern: "ANSWER:\\s*(true|false)"
        required: true
"#
            }
            SemanticFn::About => {
                r#"
cascade_id: _udf_semantic_about
cells:
  - name: score
    kind: agent
    instructions: |
      Text: {{ inputs.text }}
      Topic: {{ inputs.criterion }}
      How much is the text about the topic? Reply with
      SCORE: <number between 0 and 1>.
    output_extraction:
      - store_as: answer
        pattern: "SCORE:\\s*([0-9.]+)"
        required: true
"#
            }
            SemanticFn::Extract => {
                r#"
cascade_id: _udf_semantic_extract
cells:
  - name: extract
    kind: agent
    instructions: |
      Text: {{ inputs.text }}
      Extract: {{ inputs.criterion }}
      Reply with VALUE: <the extracted value>, nothing else.
    output_extraction:
      - store_as: answer
        pattern: "VALUE:\\s*(.+)"
        required: true
"#
            }
            SemanticFn::Fuzzy => {
                r#"
cascade_id: _udf_semantic_fuzzy
cells:
  - name: judge
    kind: agent
    instructions: |
      A: {{ inputs.text }}
      B: {{ inputs.criterion }}
      Do A and B refer to the same thing, allowing for typos and
      formatting differences? Reply with ANSWER: true or ANSWER: false.
    output_extraction:
      - store_as: answer
        pattern: "ANSWER:\\s*(true|false)"
        required: true
"#
            }
            SemanticFn::Implies => {
                r#"
cascade_id: _udf_semantic_implies
cells:
  - name: judge
    kind: agent
    instructions: |
      Premise: {{ inputs.text }}
      Conclusion: {{ inputs.criterion }}
      Does the premise logically imply the conclusion? Reply with
      ANSWER: true or ANSWER: false.
    output_extraction:
      - store_as: answer
        pattern: "ANSWER:\\s*(true|false)"
        required: true
"#
            }
            SemanticFn::Generic => {
                r#"
cascade_id: _udf_rvbbit
cells:
  - name: follow
    kind: agent
    instructions: |
      {{ inputs.text }}

      Input:
      {{ inputs.criterion }}
"#
            }
        }
    }

    /// Convert the extracted answer to the function's return type.
    fn typed_result(&self, answer: &Value, fallback: &str) -> Value {
        match self {
            SemanticFn::Matches | SemanticFn::Fuzzy | SemanticFn::Implies => {
                json!(answer.as_str().map(|s| s.trim() == "true").unwrap_or(false))
            }
            SemanticFn::About => {
                let score = answer
                    .as_str()
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .unwrap_or(0.0);
                json!(score.clamp(0.0, 1.0))
            }
            SemanticFn::Extract => json!(answer
                .as_str()
                .map(|s| s.trim().to_string())
                .unwrap_or_default()),
            SemanticFn::Generic => json!(fallback.trim()),
        }
    }
}

const ALL_SCALARS: &[SemanticFn] = &[
    SemanticFn::Matches,
    SemanticFn::About,
    SemanticFn::Extract,
    SemanticFn::Fuzzy,
    SemanticFn::Implies,
    SemanticFn::Generic,
];

/// Aggregate UDFs: (name, arity, instruction template).
const AGGREGATES: &[(&str, i32, &str)] = &[
    ("summarize", 1, "Summarize the following values into one concise summary."),
    ("themes", 2, "List the main themes across the following values (second argument: how many)."),
    (
        "cluster",
        3,
        "Group the following values into clusters (second argument: cluster count, third: hint).",
    ),
    ("consensus", 1, "State the consensus position across the following values."),
    (
        "outliers",
        3,
        "Identify outlier values (second argument: how many, third: the criterion).",
    ),
    ("sentiment", 1, "Give the overall sentiment (positive/negative/mixed/neutral) of the values."),
];

/// The UDF bridge. One per process; shared by every OLAP session.
pub struct UdfBridge {
    scheduler: Scheduler,
    semaphore: Arc<Semaphore>,
    caller: Mutex<Option<CallerContext>>,
    cascades: Mutex<HashMap<&'static str, Arc<CascadeDef>>>,
}

impl UdfBridge {
    pub fn new(scheduler: Scheduler) -> Arc<Self> {
        let bound = env_vars::env_usize(env_vars::MAX_LLM_CONCURRENCY, 8);
        Arc::new(Self {
            scheduler,
            semaphore: Arc::new(Semaphore::new(bound.max(1))),
            caller: Mutex::new(None),
            cascades: Mutex::new(HashMap::new()),
        })
    }

    /// Install the caller context for subsequent UDF dispatches. The PG
    /// server calls this before the first UDF call of each statement so
    /// spawned sub-sessions roll up under the SQL request.
    pub fn set_caller(&self, ctx: Option<CallerContext>) {
        *self.caller.lock() = ctx;
    }

    fn spawn_link(&self) -> SpawnLink {
        let caller = self
            .caller
            .lock()
            .clone()
            .or_else(rvbbit_core::caller::current);
        SpawnLink {
            caller_id: caller.as_ref().map(|c| c.caller_id.clone()),
            metadata: caller.map(|c| c.metadata).unwrap_or_default(),
            depth: current_depth() + 1,
            parent_session: None,
        }
    }

    fn mini_cascade(&self, function: SemanticFn) -> Result<Arc<CascadeDef>> {
        let mut cascades = self.cascades.lock();
        if let Some(def) = cascades.get(function.name()) {
            return Ok(def.clone());
        }
        let def = Arc::new(parse_cascade(function.cascade_yaml())?);
        cascades.insert(function.name(), def.clone());
        Ok(def)
    }

    /// One scalar dispatch, cache-first.
    pub async fn dispatch_scalar(
        self: &Arc<Self>,
        function: SemanticFn,
        text: String,
        criterion: String,
    ) -> Result<Value> {
        let policy = CachePolicy::with_ttl(SEMANTIC_TTL_SECS);
        let args = json!({ "text": text, "criterion": criterion });
        let bridge = self.clone();
        let inputs = args.clone();
        self.scheduler
            .cache()
            .get_or_build(function.name(), &args, &policy, move || async move {
                bridge.run_mini_cascade(function, inputs).await
            })
            .await
    }

    async fn run_mini_cascade(self: &Arc<Self>, function: SemanticFn, inputs: Value) -> Result<Value> {
        let def = self.mini_cascade(function)?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        let outcome = self
            .scheduler
            .run_linked(def, inputs, self.spawn_link())
            .await?;
        if outcome.status == CascadeStatus::Failed {
            return Err(Error::Other(format!(
                "{} dispatch failed: {}",
                function.name(),
                outcome
                    .errors
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_default()
            )));
        }
        let answer = outcome.state.get("answer").cloned().unwrap_or(Value::Null);
        let fallback = outcome
            .final_output()
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| outcome.final_output().to_string());
        Ok(function.typed_result(&answer, &fallback))
    }

    /// Batched row dispatch: group identical inputs, one dispatch per unique
    /// key, results distributed back to row positions in order.
    pub async fn dispatch_rows(
        self: &Arc<Self>,
        function: SemanticFn,
        rows: Vec<(String, String)>,
    ) -> Result<Vec<Value>> {
        let mut unique: Vec<(String, (String, String))> = Vec::new();
        let mut positions: Vec<usize> = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = canonical_json(&json!({ "text": row.0, "criterion": row.1 }));
            match unique.iter().position(|(k, _)| k == &key) {
                Some(i) => positions.push(i),
                None => {
                    positions.push(unique.len());
                    unique.push((key, row.clone()));
                }
            }
        }

        let results = futures::future::join_all(unique.into_iter().map(|(_, (text, criterion))| {
            let bridge = self.clone();
            async move { bridge.dispatch_scalar(function, text, criterion).await }
        }))
        .await;

        let mut resolved = Vec::with_capacity(results.len());
        for result in results {
            resolved.push(result?);
        }
        Ok(positions.into_iter().map(|i| resolved[i].clone()).collect())
    }

    /// `rvbbit_run(path, inputs_json)`: dispatch a user cascade file, return
    /// its outputs as JSON.
    pub async fn run_cascade_file(self: &Arc<Self>, path: &str, inputs_json: &str) -> Result<Value> {
        let inputs: Value = serde_json::from_str(inputs_json)
            .map_err(|e| Error::Sql(format!("invalid cascade inputs json: {e}")))?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        let outcome = self
            .scheduler
            .run_sub_file(path.into(), inputs, self.spawn_link())
            .await?;
        Ok(json!({
            "session_id": outcome.session_id,
            "status": outcome.status,
            "outputs": Value::Object(outcome.outputs),
        }))
    }

    /// Dispatch one sub-cascade per row of a result set (`RVBBIT MAP`).
    pub async fn map_rows(self: &Arc<Self>, path: &str, rows: Vec<Value>) -> Result<Vec<Value>> {
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let bridge = self.clone();
            let path = path.to_string();
            tasks.push(async move {
                let _permit = bridge
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| Error::Cancelled)?;
                let outcome = bridge
                    .scheduler
                    .run_sub_file(path.into(), row, bridge.spawn_link())
                    .await?;
                Ok::<Value, Error>(json!({
                    "session_id": outcome.session_id,
                    "status": outcome.status,
                    "outputs": Value::Object(outcome.outputs),
                }))
            });
        }
        let results = futures::future::join_all(tasks).await;
        results.into_iter().collect()
    }

    /// Register every scalar and aggregate UDF on an OLAP engine.
    pub async fn register_udfs(self: &Arc<Self>, engine: &dyn OlapEngine) -> Result<()> {
        let handle = tokio::runtime::Handle::current();

        for &function in ALL_SCALARS {
            let bridge = self.clone();
            let handle = handle.clone();
            engine
                .register_scalar_udf(
                    function.name().to_string(),
                    function.arity(),
                    Box::new(move |args| {
                        let text = scalar_arg(&args, 0);
                        let criterion = scalar_arg(&args, 1);
                        handle
                            .block_on(bridge.dispatch_scalar(function, text, criterion))
                            .map_err(|e| e.to_string())
                    }),
                )
                .await?;
        }

        // rvbbit_run(path, inputs_json)
        {
            let bridge = self.clone();
            let handle = handle.clone();
            engine
                .register_scalar_udf(
                    "rvbbit_run".to_string(),
                    2,
                    Box::new(move |args| {
                        let path = scalar_arg(&args, 0);
                        let inputs = scalar_arg(&args, 1);
                        handle
                            .block_on(bridge.run_cascade_file(&path, &inputs))
                            .map(|v| Value::String(v.to_string()))
                            .map_err(|e| e.to_string())
                    }),
                )
                .await?;
        }

        for &(name, arity, instruction) in AGGREGATES {
            let bridge = self.clone();
            let handle = handle.clone();
            engine
                .register_aggregate_udf(
                    name.to_string(),
                    arity,
                    Box::new(move |rows| {
                        if rows.is_empty() {
                            return Ok(Value::Null);
                        }
                        let values: Vec<String> = rows
                            .iter()
                            .map(|r| value_text(r.first().unwrap_or(&Value::Null)))
                            .collect();
                        let extra: Vec<String> = rows[0]
                            .iter()
                            .skip(1)
                            .map(value_text)
                            .collect();
                        let mut instruction = instruction.to_string();
                        if !extra.is_empty() {
                            instruction.push_str(&format!(" Arguments: {}.", extra.join(", ")));
                        }
                        handle
                            .block_on(bridge.dispatch_scalar(
                                SemanticFn::Generic,
                                instruction,
                                values.join("\n"),
                            ))
                            .map_err(|e| e.to_string())
                    }),
                )
                .await?;
        }

        Ok(())
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

fn scalar_arg(args: &[Value], index: usize) -> String {
    args.get(index).map(value_text).unwrap_or_default()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvbbit_engine::StaticModelFactory;
    use rvbbit_events::{EventLog, EventLogConfig};
    use rvbbit_providers::MockChatModel;
    use rvbbit_registry::SkillRegistry;

    fn bridge_with_mock() -> (Arc<UdfBridge>, Arc<MockChatModel>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::start(EventLogConfig::new(tmp.path())).unwrap();
        let registry = Arc::new(SkillRegistry::new());
        let mock = Arc::new(MockChatModel::new());
        let models = Arc::new(StaticModelFactory::new(mock.clone()));
        let cache = Arc::new(rvbbit_cache::ResultCache::new(256));
        let scheduler = Scheduler::new(registry, cache, log, models);
        (UdfBridge::new(scheduler), mock, tmp)
    }

    #[tokio::test]
    async fn semantic_matches_returns_bool() {
        let (bridge, mock, _tmp) = bridge_with_mock();
        mock.push_text("ANSWER: true");
        let result = bridge
            .dispatch_scalar(
                SemanticFn::Matches,
                "the service was terrible".into(),
                "angry customer".into(),
            )
            .await
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[tokio::test]
    async fn extract_scenario_cache_counts() {
        let (bridge, mock, _tmp) = bridge_with_mock();
        // Two unique inputs -> exactly two dispatches.
        mock.push_text("VALUE: Jane");
        mock.push_text("VALUE: John");

        let rows = vec![
            ("Jane Doe".to_string(), "first_name".to_string()),
            ("Jane Doe".to_string(), "first_name".to_string()),
            ("John Roe".to_string(), "first_name".to_string()),
        ];
        let results = bridge
            .dispatch_rows(SemanticFn::Extract, rows)
            .await
            .unwrap();

        assert_eq!(results, vec![json!("Jane"), json!("Jane"), json!("John")]);
        assert_eq!(mock.request_count(), 2, "duplicate rows must not dispatch");

        // Batching groups duplicates before the cache, so only the two
        // unique keys ever reach it.
        let stats = bridge.scheduler().cache().stats();
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn about_clamps_score() {
        let (bridge, mock, _tmp) = bridge_with_mock();
        mock.push_text("SCORE: 0.85");
        let result = bridge
            .dispatch_scalar(SemanticFn::About, "melting glaciers".into(), "climate".into())
            .await
            .unwrap();
        assert_eq!(result, json!(0.85));
    }

    #[tokio::test]
    async fn failed_mini_cascade_surfaces_error() {
        let (bridge, mock, _tmp) = bridge_with_mock();
        // No ANSWER marker: required extraction fails the cascade.
        mock.push_text("I refuse to answer in the requested format");
        let err = bridge
            .dispatch_scalar(SemanticFn::Matches, "text".into(), "criterion".into())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("semantic_matches"));
    }

    #[tokio::test]
    async fn generic_udf_returns_content() {
        let (bridge, mock, _tmp) = bridge_with_mock();
        mock.push_text("A haiku about rows");
        let result = bridge
            .dispatch_scalar(
                SemanticFn::Generic,
                "Write a haiku about".into(),
                "database rows".into(),
            )
            .await
            .unwrap();
        assert_eq!(result, json!("A haiku about rows"));
    }
}
