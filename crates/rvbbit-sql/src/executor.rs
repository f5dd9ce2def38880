//! The SQL execution front: rewrite a statement, then route it to the OLAP
//! engine, the UDF bridge, or the directive handlers.
//!
//! This is the layer the PG wire server and the CLI talk to; one executor
//! wraps one OLAP session.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};

use rvbbit_core::{Error, Result};
use rvbbit_engine::SqlCellRunner;
use rvbbit_events::NodeKind;

use crate::bridge::UdfBridge;
use crate::olap::{OlapEngine, QueryResult};
use crate::rewrite::{union_all_split, Directive, Rewritten, SqlRewriter};
use crate::vector::{lexical_vector, search_results_json, InMemoryVectorStore, VectorEntry, VectorStore};

/// Outcome of executing one statement.
#[derive(Debug)]
pub enum ExecOutcome {
    Rows(QueryResult),
    Affected(u64),
    /// Handle to a background job started by `BACKGROUND <stmt>`.
    Handle(String),
    /// Structured result of a directive (`RVBBIT RUN/MAP`, `ANALYZE`).
    Json(Value),
}

impl ExecOutcome {
    /// Render as a result set for wire protocols that always stream rows.
    pub fn into_result(self) -> QueryResult {
        match self {
            ExecOutcome::Rows(result) => result,
            ExecOutcome::Affected(n) => QueryResult {
                columns: vec!["affected".to_string()],
                rows: vec![vec![json!(n)]],
            },
            ExecOutcome::Handle(id) => QueryResult {
                columns: vec!["handle".to_string()],
                rows: vec![vec![json!(id)]],
            },
            ExecOutcome::Json(value) => match value {
                Value::Array(items) => QueryResult {
                    columns: vec!["result".to_string()],
                    rows: items.into_iter().map(|v| vec![v]).collect(),
                },
                other => QueryResult {
                    columns: vec!["result".to_string()],
                    rows: vec![vec![other]],
                },
            },
        }
    }
}

enum JobState {
    Running(tokio::task::JoinHandle<Result<u64>>),
    Done(Result<u64>),
}

/// One OLAP session's executor: rewriter + engine + bridge + vector store.
pub struct SqlExecutor {
    engine: Arc<dyn OlapEngine>,
    rewriter: Arc<RwLock<SqlRewriter>>,
    bridge: Arc<UdfBridge>,
    vectors: Arc<InMemoryVectorStore>,
    jobs: DashMap<String, JobState>,
}

impl SqlExecutor {
    /// Wire up an executor: registers the LLM UDFs and the vector-search UDF
    /// on the engine.
    pub async fn new(
        engine: Arc<dyn OlapEngine>,
        bridge: Arc<UdfBridge>,
        rewriter: Arc<RwLock<SqlRewriter>>,
    ) -> Result<Arc<Self>> {
        bridge.register_udfs(engine.as_ref()).await?;

        let vectors = Arc::new(InMemoryVectorStore::new());
        {
            let vectors = vectors.clone();
            engine
                .register_scalar_udf(
                    "vector_search_json".to_string(),
                    5,
                    Box::new(move |args| {
                        let query = args.first().and_then(Value::as_str).unwrap_or_default();
                        let table = args.get(1).and_then(Value::as_str).unwrap_or_default();
                        let column = args.get(2).and_then(Value::as_str).unwrap_or_default();
                        let k = args.get(3).and_then(Value::as_u64).unwrap_or(10) as usize;
                        let min_score = args.get(4).and_then(Value::as_f64).unwrap_or(0.0);
                        let namespace = format!("{table}.{column}");
                        let results = vectors
                            .search(&namespace, &lexical_vector(query), k, min_score)
                            .map_err(|e| e.to_string())?;
                        Ok(Value::String(search_results_json(&results).to_string()))
                    }),
                )
                .await?;
        }

        Ok(Arc::new(Self {
            engine,
            rewriter,
            bridge,
            vectors,
            jobs: DashMap::new(),
        }))
    }

    pub fn bridge(&self) -> &Arc<UdfBridge> {
        &self.bridge
    }

    pub fn engine(&self) -> &Arc<dyn OlapEngine> {
        &self.engine
    }

    /// Execute one statement end to end.
    /// Returns a boxed, type-erased future (rather than `async fn`) because
    /// `BACKGROUND <stmt>` directives spawn a task that calls back into
    /// `execute`; an opaque `impl Future` return type here cannot resolve
    /// its own hidden type in that recursion cycle.
    pub fn execute<'a>(
        self: &'a Arc<Self>,
        sql: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ExecOutcome>> + Send + 'a>>
    {
        Box::pin(async move {
            // UDF dispatches spawned by this statement must roll up under the
            // caller of the current task.
            self.bridge.set_caller(rvbbit_core::caller::current());

            let rewritten = self.rewriter.read().rewrite(sql)?;
            match rewritten {
                Rewritten::Query {
                    sql,
                    warnings,
                    parallel,
                    ..
                } => {
                    for warning in &warnings {
                        tracing::warn!("{warning}");
                        if let Some(log) = rvbbit_events::global() {
                            let caller = rvbbit_core::caller::current()
                                .map(|c| c.caller_id)
                                .unwrap_or_default();
                            log.log(
                                rvbbit_events::Event::new(NodeKind::Warning, "", "", caller)
                                    .with_content(json!({ "warning": warning, "sql": sql })),
                            );
                        }
                    }
                    self.run_query(&sql, parallel).await
                }
                Rewritten::Directive(directive) => self.run_directive(directive).await,
            }
        })
    }

    async fn run_query(&self, sql: &str, parallel: Option<usize>) -> Result<ExecOutcome> {
        let effective = match parallel {
            Some(n) => match union_all_split(sql, n) {
                Some(split) => split,
                None => {
                    tracing::warn!("parallel hint ignored: statement is not splittable");
                    sql.to_string()
                }
            },
            None => sql.to_string(),
        };

        if is_row_returning(&effective) {
            Ok(ExecOutcome::Rows(self.engine.query(&effective).await?))
        } else {
            Ok(ExecOutcome::Affected(self.engine.execute(&effective).await?))
        }
    }

    async fn run_directive(self: &Arc<Self>, directive: Directive) -> Result<ExecOutcome> {
        match directive {
            Directive::Run { path, inputs_json } => {
                let result = self.bridge.run_cascade_file(&path, &inputs_json).await?;
                Ok(ExecOutcome::Json(result))
            }
            Directive::Map { path, subquery } => {
                let subquery = self.rewrite_plain(&subquery)?;
                let rows = self.engine.query(&subquery).await?;
                let results = self.bridge.map_rows(&path, rows.to_json_rows()).await?;
                Ok(ExecOutcome::Json(Value::Array(results)))
            }
            Directive::Embed {
                table,
                column,
                subquery,
                options,
            } => self.run_embed(&table, &column, &subquery, &options).await,
            Directive::Background { statement } => {
                let id = format!("bg-{}", uuid::Uuid::new_v4().simple());
                let this = self.clone();
                let caller = rvbbit_core::caller::current();
                let handle = tokio::spawn(async move {
                    let fut = async move {
                        let outcome = this.execute(&statement).await?;
                        Ok::<u64, Error>(match outcome {
                            ExecOutcome::Rows(r) => r.rows.len() as u64,
                            ExecOutcome::Affected(n) => n,
                            _ => 0,
                        })
                    };
                    match caller {
                        Some(ctx) => rvbbit_core::caller::with_caller(ctx, fut).await,
                        None => fut.await,
                    }
                });
                self.jobs.insert(id.clone(), JobState::Running(handle));
                Ok(ExecOutcome::Handle(id))
            }
            Directive::Analyze { statement } => {
                let inner = self.rewrite_plain(&statement)?;
                let plan = self
                    .engine
                    .query(&format!("EXPLAIN QUERY PLAN {inner}"))
                    .await?;
                Ok(ExecOutcome::Json(json!({
                    "statement": inner,
                    "plan": plan.to_json_rows(),
                })))
            }
        }
    }

    /// Rewrite a nested statement (directive subqueries), rejecting nested
    /// directives.
    fn rewrite_plain(&self, sql: &str) -> Result<String> {
        match self.rewriter.read().rewrite(sql)? {
            Rewritten::Query { sql, .. } => Ok(sql),
            Rewritten::Directive(_) => {
                Err(Error::Sql("directives cannot nest inside other directives".into()))
            }
        }
    }

    async fn run_embed(
        &self,
        table: &str,
        column: &str,
        subquery: &str,
        options: &HashMap<String, String>,
    ) -> Result<ExecOutcome> {
        let subquery = self.rewrite_plain(subquery)?;
        let rows = self.engine.query(&subquery).await?;
        let namespace = format!("{table}.{column}");

        // Prefer the named column for text; otherwise the second column;
        // otherwise the only column. The first column doubles as the id.
        let text_index = rows
            .columns
            .iter()
            .position(|c| c == column)
            .unwrap_or(if rows.columns.len() > 1 { 1 } else { 0 });

        let mut count = 0u64;
        for (i, row) in rows.rows.iter().enumerate() {
            let id = row
                .first()
                .map(value_text)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| i.to_string());
            let text = row.get(text_index).map(value_text).unwrap_or_default();
            if text.is_empty() {
                continue;
            }
            let mut metadata = json!({ "column_name": column });
            for (k, v) in options {
                metadata[k] = json!(v);
            }
            self.vectors.upsert(
                &namespace,
                VectorEntry {
                    id,
                    text: text.clone(),
                    vector: lexical_vector(&text),
                    metadata,
                },
            )?;
            count += 1;
        }
        Ok(ExecOutcome::Affected(count))
    }

    /// Poll a background job: `running`, `done`, or `error: ...`.
    pub async fn background_status(&self, id: &str) -> Option<String> {
        let mut entry = self.jobs.get_mut(id)?;
        let status = match &mut *entry {
            JobState::Running(handle) => {
                if handle.is_finished() {
                    let result = handle
                        .await
                        .unwrap_or_else(|e| Err(Error::Other(format!("job panicked: {e}"))));
                    let status = match &result {
                        Ok(n) => format!("done ({n} rows)"),
                        Err(e) => format!("error: {e}"),
                    };
                    *entry = JobState::Done(result);
                    status
                } else {
                    "running".to_string()
                }
            }
            JobState::Done(Ok(n)) => format!("done ({n} rows)"),
            JobState::Done(Err(e)) => format!("error: {e}"),
        };
        Some(status)
    }

    pub fn vectors(&self) -> &Arc<InMemoryVectorStore> {
        &self.vectors
    }
}

/// Whether a statement returns rows (drives query vs execute routing).
fn is_row_returning(sql: &str) -> bool {
    let first = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(first.as_str(), "SELECT" | "WITH" | "VALUES" | "PRAGMA" | "EXPLAIN" | "SHOW")
}

// ---------------------------------------------------------------------------
// `sql` cell runner
// ---------------------------------------------------------------------------

/// Runs `sql` cells for the scheduler, materializing row results into a temp
/// table named `_<cell>` so downstream cells can reference them.
pub struct OlapCellRunner {
    executor: Arc<SqlExecutor>,
}

impl OlapCellRunner {
    pub fn new(executor: Arc<SqlExecutor>) -> Arc<Self> {
        Arc::new(Self { executor })
    }
}

#[async_trait::async_trait]
impl SqlCellRunner for OlapCellRunner {
    async fn run_sql(&self, sql: &str, materialize_as: Option<&str>) -> Result<Value> {
        let outcome = self.executor.execute(sql).await?;
        let result = match outcome {
            ExecOutcome::Rows(result) => result,
            other => return Ok(other.into_result().to_json_rows().into()),
        };

        if let Some(table) = materialize_as {
            self.materialize(table, &result).await?;
        }
        Ok(Value::Array(result.to_json_rows()))
    }
}

impl OlapCellRunner {
    async fn materialize(&self, table: &str, result: &QueryResult) -> Result<()> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Sql(format!("invalid temp table name {table:?}")));
        }
        let engine = self.executor.engine();
        engine
            .execute(&format!("DROP TABLE IF EXISTS {table}"))
            .await?;
        if result.columns.is_empty() {
            return Ok(());
        }
        let columns: Vec<String> = result
            .columns
            .iter()
            .map(|c| format!("\"{}\" TEXT", c.replace('"', "")))
            .collect();
        engine
            .execute(&format!("CREATE TABLE {table} ({})", columns.join(", ")))
            .await?;
        for row in &result.rows {
            let values: Vec<String> = row.iter().map(sql_literal).collect();
            engine
                .execute(&format!(
                    "INSERT INTO {table} VALUES ({})",
                    values.join(", ")
                ))
                .await?;
        }
        Ok(())
    }
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
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
    use crate::olap::SqliteEngine;
    use rvbbit_engine::{Scheduler, StaticModelFactory};
    use rvbbit_events::{EventLog, EventLogConfig};
    use rvbbit_providers::MockChatModel;
    use rvbbit_registry::SkillRegistry;

    async fn executor_with_mock() -> (Arc<SqlExecutor>, Arc<MockChatModel>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::start(EventLogConfig::new(tmp.path())).unwrap();
        let registry = Arc::new(SkillRegistry::new());
        let mock = Arc::new(MockChatModel::new());
        let models = Arc::new(StaticModelFactory::new(mock.clone()));
        let cache = Arc::new(rvbbit_cache::ResultCache::new(1024));
        let scheduler = Scheduler::new(registry, cache, log, models);
        let bridge = UdfBridge::new(scheduler);

        let engine: Arc<dyn OlapEngine> = Arc::new(SqliteEngine::open_in_memory().await.unwrap());
        let rewriter = Arc::new(RwLock::new(SqlRewriter::new()));
        let executor = SqlExecutor::new(engine, bridge, rewriter).await.unwrap();
        (executor, mock, tmp)
    }

    #[tokio::test]
    async fn plain_queries_pass_through() {
        let (executor, _mock, _tmp) = executor_with_mock().await;
        executor
            .execute("CREATE TABLE t (id INTEGER, name TEXT)")
            .await
            .unwrap();
        executor
            .execute("INSERT INTO t VALUES (1, 'one'), (2, 'two')")
            .await
            .unwrap();

        match executor.execute("SELECT name FROM t ORDER BY id").await.unwrap() {
            ExecOutcome::Rows(result) => {
                assert_eq!(result.rows.len(), 2);
                assert_eq!(result.rows[0][0], json!("one"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn semantic_extract_row_dispatch_with_cache() {
        let (executor, mock, _tmp) = executor_with_mock().await;
        mock.push_text("VALUE: Jane");
        mock.push_text("VALUE: John");

        executor
            .execute("CREATE TABLE people (name TEXT)")
            .await
            .unwrap();
        executor
            .execute("INSERT INTO people VALUES ('Jane Doe'), ('Jane Doe'), ('John Roe')")
            .await
            .unwrap();

        match executor
            .execute("SELECT name, name EXTRACTS 'first_name' AS fn FROM people")
            .await
            .unwrap()
        {
            ExecOutcome::Rows(result) => {
                assert_eq!(result.rows.len(), 3);
                let fns: Vec<&str> = result
                    .rows
                    .iter()
                    .map(|r| r[1].as_str().unwrap())
                    .collect();
                assert_eq!(fns, vec!["Jane", "Jane", "John"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Exactly 2 misses (unique inputs) and 1 hit (the duplicate row).
        let stats = executor.bridge().scheduler().cache().stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(mock.request_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn semantic_matches_filters_rows() {
        let (executor, mock, _tmp) = executor_with_mock().await;
        executor
            .execute("CREATE TABLE reviews (body TEXT)")
            .await
            .unwrap();
        executor
            .execute("INSERT INTO reviews VALUES ('this is awful'), ('i love it')")
            .await
            .unwrap();
        mock.push_text("ANSWER: true");
        mock.push_text("ANSWER: false");

        match executor
            .execute("SELECT body FROM reviews WHERE body MEANS 'negative review'")
            .await
            .unwrap()
        {
            ExecOutcome::Rows(result) => {
                assert_eq!(result.rows.len(), 1);
                assert_eq!(result.rows[0][0], json!("this is awful"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn embed_then_vector_search() {
        let (executor, _mock, _tmp) = executor_with_mock().await;
        executor
            .execute("CREATE TABLE docs (id INTEGER, body TEXT)")
            .await
            .unwrap();
        executor
            .execute(
                "INSERT INTO docs VALUES (1, 'rust ownership and borrowing'), \
                 (2, 'gardening through winter')",
            )
            .await
            .unwrap();

        match executor
            .execute("RVBBIT EMBED docs.body USING (SELECT id, body FROM docs) WITH (backend='local')")
            .await
            .unwrap()
        {
            ExecOutcome::Affected(n) => assert_eq!(n, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(executor.vectors().count("docs.body"), 2);

        match executor
            .execute("SELECT vector_search_json('rust borrowing', 'docs', 'body', 1, 0.0)")
            .await
            .unwrap()
        {
            ExecOutcome::Rows(result) => {
                let payload: Value =
                    serde_json::from_str(result.rows[0][0].as_str().unwrap()).unwrap();
                assert_eq!(payload[0]["id"], json!("1"));
                assert_eq!(payload[0]["metadata"]["column_name"], json!("body"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn parallel_hint_splits_but_loses_no_rows() {
        let (executor, _mock, _tmp) = executor_with_mock().await;
        executor.execute("CREATE TABLE nums (v INTEGER)").await.unwrap();
        executor
            .execute("INSERT INTO nums VALUES (10), (20), (30), (40), (50)")
            .await
            .unwrap();

        match executor
            .execute("-- @ parallel: 2\nSELECT v FROM nums")
            .await
            .unwrap()
        {
            ExecOutcome::Rows(result) => {
                let mut values: Vec<i64> = result
                    .rows
                    .iter()
                    .map(|r| r[0].as_i64().unwrap())
                    .collect();
                values.sort();
                assert_eq!(values, vec![10, 20, 30, 40, 50]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn background_directive_returns_handle() {
        let (executor, _mock, _tmp) = executor_with_mock().await;
        executor.execute("CREATE TABLE t (a INTEGER)").await.unwrap();

        let handle = match executor
            .execute("BACKGROUND INSERT INTO t VALUES (1)")
            .await
            .unwrap()
        {
            ExecOutcome::Handle(id) => id,
            other => panic!("unexpected {other:?}"),
        };

        // Poll until the job lands.
        for _ in 0..50 {
            let status = executor.background_status(&handle).await.unwrap();
            if status.starts_with("done") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        match executor.execute("SELECT count(*) FROM t").await.unwrap() {
            ExecOutcome::Rows(result) => assert_eq!(result.rows[0][0], json!(1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn analyze_directive_returns_plan() {
        let (executor, _mock, _tmp) = executor_with_mock().await;
        executor.execute("CREATE TABLE t (a INTEGER)").await.unwrap();
        match executor.execute("ANALYZE SELECT * FROM t").await.unwrap() {
            ExecOutcome::Json(value) => {
                assert_eq!(value["statement"], json!("SELECT * FROM t"));
                assert!(value["plan"].is_array());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rvbbit_run_directive_dispatches_cascade() {
        let (executor, _mock, _tmp) = executor_with_mock().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        // Use a tool cell so no model turns are needed; echo is not in this
        // harness's registry, so register builtins first.
        rvbbit_registry::builtin::register_builtins(
            executor.bridge().scheduler().registry(),
        );
        std::fs::write(
            &path,
            r#"
cascade_id: flow
cells:
  - name: out
    kind: tool
    traits: [echo]
    inputs:
      ticket: "{{ inputs.ticket }}"
"#,
        )
        .unwrap();

        let sql = format!(
            "RVBBIT RUN '{}' WITH ({{\"ticket\": 42}})",
            path.display()
        );
        match executor.execute(&sql).await.unwrap() {
            ExecOutcome::Json(value) => {
                assert_eq!(value["status"], json!("completed"));
                assert_eq!(value["outputs"]["out"]["ticket"], json!("42"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn sql_cell_runner_materializes_temp_table() {
        let (executor, _mock, _tmp) = executor_with_mock().await;
        executor
            .execute("CREATE TABLE src (a INTEGER, b TEXT)")
            .await
            .unwrap();
        executor
            .execute("INSERT INTO src VALUES (1, 'x'), (2, 'y')")
            .await
            .unwrap();

        let runner = OlapCellRunner::new(executor.clone());
        let value = runner
            .run_sql("SELECT a, b FROM src ORDER BY a", Some("_stage"))
            .await
            .unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);

        match executor.execute("SELECT b FROM _stage ORDER BY a").await.unwrap() {
            ExecOutcome::Rows(result) => {
                assert_eq!(result.rows[0][0], json!("x"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
