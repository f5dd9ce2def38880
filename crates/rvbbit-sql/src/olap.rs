//! The OLAP adapter: a narrow interface to the embedded SQL engine, plus the
//! default SQLite-backed implementation.
//!
//! `rusqlite::Connection` is not `Send`/`Sync`, so the connection lives on a
//! dedicated worker thread and async callers talk to it over channels. UDF
//! callbacks run on that worker thread, which is exactly what lets the LLM
//! UDF bridge block on scheduler dispatches without stalling the runtime.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use async_trait::async_trait;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use rvbbit_core::{Error, Result};

/// Scalar UDF callback: JSON in, JSON out. Errors surface as SQL errors.
pub type ScalarUdf =
    Box<dyn Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + 'static>;

/// Aggregate UDF finalizer: all collected argument rows in, JSON out.
pub type AggregateFinalize =
    Box<dyn Fn(Vec<Vec<Value>>) -> std::result::Result<Value, String> + Send + 'static>;

/// A query result in wire-friendly shape.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// Rows as JSON objects keyed by column name.
    pub fn to_json_rows(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (i, col) in self.columns.iter().enumerate() {
                    obj.insert(col.clone(), row.get(i).cloned().unwrap_or(Value::Null));
                }
                Value::Object(obj)
            })
            .collect()
    }
}

/// Narrow interface to the embedded OLAP engine.
///
/// The engine is an external collaborator; this trait is everything the core
/// needs from it: queries, statements, UDF registration hooks, and
/// attachable databases.
#[async_trait]
pub trait OlapEngine: Send + Sync {
    async fn query(&self, sql: &str) -> Result<QueryResult>;

    /// Execute a statement; returns affected-row count.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Register a scalar UDF. `arity` of -1 means variadic.
    async fn register_scalar_udf(&self, name: String, arity: i32, f: ScalarUdf) -> Result<()>;

    /// Register an aggregate UDF by its finalizer.
    async fn register_aggregate_udf(
        &self,
        name: String,
        arity: i32,
        f: AggregateFinalize,
    ) -> Result<()>;

    /// Attach another database file under an alias.
    async fn attach(&self, path: String, alias: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

enum Cmd {
    Query {
        sql: String,
        resp: oneshot::Sender<Result<QueryResult>>,
    },
    Execute {
        sql: String,
        resp: oneshot::Sender<Result<u64>>,
    },
    Scalar {
        name: String,
        arity: i32,
        f: ScalarUdf,
        resp: oneshot::Sender<Result<()>>,
    },
    Aggregate {
        name: String,
        arity: i32,
        f: AggregateFinalize,
        resp: oneshot::Sender<Result<()>>,
    },
    Attach {
        path: String,
        alias: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

/// SQLite-backed [`OlapEngine`]. One connection per instance; PG sessions
/// each get their own instance and never share one.
pub struct SqliteEngine {
    tx: mpsc::Sender<Cmd>,
}

impl SqliteEngine {
    /// In-memory engine (each instance is its own database).
    pub async fn open_in_memory() -> Result<Self> {
        Self::start(None).await
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::start(Some(path.into())).await
    }

    async fn start(path: Option<PathBuf>) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Cmd>(64);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        std::thread::Builder::new()
            .name("rvbbit-olap".into())
            .spawn(move || {
                let conn = match path {
                    Some(p) => Connection::open(p),
                    None => Connection::open_in_memory(),
                };
                let conn = match conn {
                    Ok(c) => {
                        let _ = ready_tx.send(Ok(()));
                        c
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::Sql(format!("sqlite open: {e}"))));
                        return;
                    }
                };

                while let Some(cmd) = rx.blocking_recv() {
                    match cmd {
                        Cmd::Query { sql, resp } => {
                            let _ = resp.send(run_query(&conn, &sql));
                        }
                        Cmd::Execute { sql, resp } => {
                            let result = conn
                                .execute_batch(&sql)
                                .map(|_| conn.changes())
                                .map_err(|e| Error::Sql(e.to_string()));
                            let _ = resp.send(result);
                        }
                        Cmd::Scalar {
                            name,
                            arity,
                            f,
                            resp,
                        } => {
                            let f = AssertUnwindSafe(f);
                            let result = conn
                                .create_scalar_function(
                                    &name,
                                    arity,
                                    FunctionFlags::SQLITE_UTF8,
                                    move |ctx| {
                                        let mut args = Vec::with_capacity(ctx.len());
                                        for i in 0..ctx.len() {
                                            args.push(value_ref_to_json(ctx.get_raw(i)));
                                        }
                                        (f.0)(args).map(json_to_sql).map_err(|e| {
                                            rusqlite::Error::UserFunctionError(e.into())
                                        })
                                    },
                                )
                                .map_err(|e| Error::Sql(e.to_string()));
                            let _ = resp.send(result);
                        }
                        Cmd::Aggregate {
                            name,
                            arity,
                            f,
                            resp,
                        } => {
                            let aggregate = CollectingAggregate {
                                finalize: AssertUnwindSafe(f),
                            };
                            let result = conn
                                .create_aggregate_function(
                                    &name,
                                    arity,
                                    FunctionFlags::SQLITE_UTF8,
                                    aggregate,
                                )
                                .map_err(|e| Error::Sql(e.to_string()));
                            let _ = resp.send(result);
                        }
                        Cmd::Attach { path, alias, resp } => {
                            // Schema names cannot be bound parameters.
                            let result = if alias
                                .chars()
                                .all(|c| c.is_ascii_alphanumeric() || c == '_')
                                && !alias.is_empty()
                            {
                                conn.execute(
                                    &format!("ATTACH DATABASE ?1 AS {alias}"),
                                    rusqlite::params![path],
                                )
                                .map(|_| ())
                                .map_err(|e| Error::Sql(e.to_string()))
                            } else {
                                Err(Error::Sql(format!("invalid attach alias {alias:?}")))
                            };
                            let _ = resp.send(result);
                        }
                        Cmd::Close { resp } => {
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
            })?;

        ready_rx
            .await
            .map_err(|_| Error::Sql("olap worker died during startup".into()))??;
        Ok(Self { tx })
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Cmd,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| Error::Sql("olap worker stopped".into()))?;
        rx.await
            .map_err(|_| Error::Sql("olap worker dropped reply".into()))
    }
}

#[async_trait]
impl OlapEngine for SqliteEngine {
    async fn query(&self, sql: &str) -> Result<QueryResult> {
        let sql = sql.to_string();
        self.send(|resp| Cmd::Query { sql, resp }).await?
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let sql = sql.to_string();
        self.send(|resp| Cmd::Execute { sql, resp }).await?
    }

    async fn register_scalar_udf(&self, name: String, arity: i32, f: ScalarUdf) -> Result<()> {
        self.send(|resp| Cmd::Scalar {
            name,
            arity,
            f,
            resp,
        })
        .await?
    }

    async fn register_aggregate_udf(
        &self,
        name: String,
        arity: i32,
        f: AggregateFinalize,
    ) -> Result<()> {
        self.send(|resp| Cmd::Aggregate {
            name,
            arity,
            f,
            resp,
        })
        .await?
    }

    async fn attach(&self, path: String, alias: String) -> Result<()> {
        self.send(|resp| Cmd::Attach { path, alias, resp }).await?
    }

    async fn close(&self) -> Result<()> {
        self.send(|resp| Cmd::Close { resp }).await
    }
}

fn run_query(conn: &Connection, sql: &str) -> Result<QueryResult> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| Error::Sql(format!("prepare: {e}")))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    if columns.is_empty() {
        stmt.execute([]).map_err(|e| Error::Sql(e.to_string()))?;
        return Ok(QueryResult::default());
    }

    let column_count = columns.len();
    let mut rows = stmt.query([]).map_err(|e| Error::Sql(e.to_string()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| Error::Sql(e.to_string()))? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = row
                .get_ref(i)
                .map(value_ref_to_json)
                .map_err(|e| Error::Sql(e.to_string()))?;
            values.push(value);
        }
        out.push(values);
    }
    Ok(QueryResult { columns, rows: out })
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}

fn json_to_sql(value: Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Sql::Text(s),
        other => Sql::Text(other.to_string()),
    }
}

/// Collects every argument row, then hands the batch to a finalizer.
struct CollectingAggregate {
    finalize: AssertUnwindSafe<AggregateFinalize>,
}

impl rusqlite::functions::Aggregate<Vec<Vec<Value>>, rusqlite::types::Value>
    for CollectingAggregate
{
    fn init(&self, _ctx: &mut rusqlite::functions::Context<'_>) -> rusqlite::Result<Vec<Vec<Value>>> {
        Ok(Vec::new())
    }

    fn step(
        &self,
        ctx: &mut rusqlite::functions::Context<'_>,
        acc: &mut Vec<Vec<Value>>,
    ) -> rusqlite::Result<()> {
        let mut row = Vec::with_capacity(ctx.len());
        for i in 0..ctx.len() {
            row.push(value_ref_to_json(ctx.get_raw(i)));
        }
        acc.push(row);
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut rusqlite::functions::Context<'_>,
        acc: Option<Vec<Vec<Value>>>,
    ) -> rusqlite::Result<rusqlite::types::Value> {
        let rows = acc.unwrap_or_default();
        (self.finalize.0)(rows)
            .map(json_to_sql)
            .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn query_and_execute_round_trip() {
        let engine = SqliteEngine::open_in_memory().await.unwrap();
        engine
            .execute("CREATE TABLE t (id INTEGER, name TEXT)")
            .await
            .unwrap();
        engine
            .execute("INSERT INTO t VALUES (1, 'one'), (2, 'two')")
            .await
            .unwrap();

        let result = engine.query("SELECT id, name FROM t ORDER BY id").await.unwrap();
        assert_eq!(result.columns, vec!["id", "name"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0], vec![json!(1), json!("one")]);

        let objects = result.to_json_rows();
        assert_eq!(objects[1]["name"], json!("two"));
    }

    #[tokio::test]
    async fn scalar_udf_registration_and_call() {
        let engine = SqliteEngine::open_in_memory().await.unwrap();
        engine
            .register_scalar_udf(
                "double_it".into(),
                1,
                Box::new(|args| {
                    let n = args[0].as_i64().ok_or("expected integer")?;
                    Ok(json!(n * 2))
                }),
            )
            .await
            .unwrap();

        let result = engine.query("SELECT double_it(21)").await.unwrap();
        assert_eq!(result.rows[0][0], json!(42));
    }

    #[tokio::test]
    async fn scalar_udf_errors_surface_as_sql_errors() {
        let engine = SqliteEngine::open_in_memory().await.unwrap();
        engine
            .register_scalar_udf(
                "always_fails".into(),
                0,
                Box::new(|_| Err("deliberate".to_string())),
            )
            .await
            .unwrap();
        let err = engine.query("SELECT always_fails()").await.unwrap_err();
        assert!(err.to_string().contains("deliberate"));
    }

    #[tokio::test]
    async fn aggregate_udf_collects_rows() {
        let engine = SqliteEngine::open_in_memory().await.unwrap();
        engine
            .execute("CREATE TABLE words (w TEXT); INSERT INTO words VALUES ('a'), ('b'), ('c')")
            .await
            .unwrap();
        engine
            .register_aggregate_udf(
                "concat_all".into(),
                1,
                Box::new(|rows| {
                    let joined: Vec<String> = rows
                        .iter()
                        .filter_map(|r| r[0].as_str().map(str::to_string))
                        .collect();
                    Ok(json!(joined.join("+")))
                }),
            )
            .await
            .unwrap();

        let result = engine.query("SELECT concat_all(w) FROM words").await.unwrap();
        assert_eq!(result.rows[0][0], json!("a+b+c"));
    }

    #[tokio::test]
    async fn non_select_query_returns_empty() {
        let engine = SqliteEngine::open_in_memory().await.unwrap();
        let result = engine.query("CREATE TABLE x (a)").await.unwrap();
        assert!(result.columns.is_empty());
        assert!(result.rows.is_empty());
    }
}
