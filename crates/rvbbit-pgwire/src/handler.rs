//! Per-connection pgwire handlers.
//!
//! Each connection owns one OLAP session (its own embedded-engine
//! connection, UDF registrations, and catalog views) plus the extended
//! protocol's prepared-statement and portal state. All result columns are
//! presented as VARCHAR in text encoding; VARCHAR's binary representation is
//! identical to text, which keeps binary-format clients working.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::sink::Sink;
use futures::stream;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use serde_json::Value;
use tokio::sync::Mutex;

use rvbbit_core::caller::{with_caller, CallerContext, InvocationMetadata};
use rvbbit_core::ids::new_sql_caller_id;
use rvbbit_sql::{ExecOutcome, QueryResult, SqlExecutor};

use crate::catalog::{self, TxnControl};

fn sql_error(message: impl Into<String>) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".to_string(),
        "XX000".to_string(),
        message.into(),
    )))
}

/// A parsed extended-protocol statement: the raw SQL plus resolved parameter
/// types (client-declared, or inferred from `$n::type` casts).
#[derive(Debug, Clone)]
pub struct ParsedSql {
    pub sql: String,
    pub param_types: Vec<Type>,
}

/// The per-connection handler.
pub struct RvbbitHandler {
    executor: Arc<SqlExecutor>,
    describe_cache: Arc<Mutex<HashMap<String, QueryResult>>>,
}

impl RvbbitHandler {
    pub fn new(executor: Arc<SqlExecutor>) -> Self {
        Self {
            executor,
            describe_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn caller_for(&self, sql: &str, protocol: &str) -> CallerContext {
        CallerContext::new(
            new_sql_caller_id(),
            InvocationMetadata {
                origin: "sql".to_string(),
                query: Some(sql.to_string()),
                protocol: Some(protocol.to_string()),
            },
        )
    }

    /// Execute one statement and map it onto wire responses.
    async fn execute_sql(&self, query: &str, protocol: &str) -> PgWireResult<Response<'static>> {
        let trimmed = query.trim().trim_end_matches(';').trim();
        if trimmed.is_empty() {
            return Ok(Response::EmptyQuery);
        }

        // Unknown settings are accepted silently for client compatibility.
        if catalog::is_set_statement(trimmed) {
            return Ok(Response::Execution(Tag::new("SET")));
        }

        if let Some(control) = catalog::txn_control(trimmed) {
            let (stmt, tag) = match control {
                TxnControl::Begin => ("BEGIN", "BEGIN"),
                TxnControl::Commit => ("COMMIT", "COMMIT"),
                TxnControl::Rollback => ("ROLLBACK", "ROLLBACK"),
            };
            self.executor
                .engine()
                .execute(stmt)
                .await
                .map_err(|e| sql_error(e.to_string()))?;
            return Ok(match control {
                TxnControl::Begin => Response::TransactionStart(Tag::new(tag)),
                _ => Response::TransactionEnd(Tag::new(tag)),
            });
        }

        if let Some((column, value)) = catalog::constant_answer(trimmed) {
            return encode_result(QueryResult {
                columns: vec![column],
                rows: vec![vec![Value::String(value)]],
            });
        }

        let normalized = catalog::normalize(trimmed);
        let caller = self.caller_for(trimmed, protocol);
        let outcome = with_caller(caller, self.executor.execute(&normalized))
            .await
            .map_err(|e| sql_error(e.to_string()))?;

        match outcome {
            ExecOutcome::Rows(result) => encode_result(result),
            ExecOutcome::Affected(n) => {
                let verb = normalized
                    .split_whitespace()
                    .next()
                    .unwrap_or("OK")
                    .to_ascii_uppercase();
                let tag = if verb == "INSERT" {
                    Tag::new("INSERT 0").with_rows(n as usize)
                } else {
                    Tag::new(&verb).with_rows(n as usize)
                };
                Ok(Response::Execution(tag))
            }
            other => encode_result(other.into_result()),
        }
    }

    /// Run a substituted statement and cache its rows for the following
    /// Execute; returns the field descriptions.
    async fn describe_and_cache(&self, sql: &str) -> PgWireResult<Vec<FieldInfo>> {
        let normalized = catalog::normalize(sql);
        if !is_row_returning(&normalized) {
            return Ok(vec![]);
        }
        let caller = self.caller_for(sql, "extended");
        let outcome = with_caller(caller, self.executor.execute(&normalized))
            .await
            .map_err(|e| sql_error(e.to_string()))?;
        let result = match outcome {
            ExecOutcome::Rows(result) => result,
            other => other.into_result(),
        };
        let fields = varchar_fields(&result.columns);
        self.describe_cache
            .lock()
            .await
            .insert(sql.to_string(), result);
        Ok(fields)
    }
}

fn is_row_returning(sql: &str) -> bool {
    let first = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(first.as_str(), "SELECT" | "WITH" | "VALUES" | "PRAGMA" | "EXPLAIN" | "SHOW")
}

fn varchar_fields(columns: &[String]) -> Vec<FieldInfo> {
    columns
        .iter()
        .map(|name| FieldInfo::new(name.clone(), None, None, Type::VARCHAR, FieldFormat::Text))
        .collect()
}

fn encode_result(result: QueryResult) -> PgWireResult<Response<'static>> {
    let fields = Arc::new(varchar_fields(&result.columns));
    let row_fields = fields.clone();
    let rows = stream::iter(result.rows.into_iter().map(move |row| {
        let mut encoder = DataRowEncoder::new(row_fields.clone());
        for value in row {
            match value {
                Value::Null => encoder.encode_field(&None::<String>)?,
                Value::String(s) => encoder.encode_field(&s)?,
                other => encoder.encode_field(&other.to_string())?,
            }
        }
        encoder.finish()
    }));
    Ok(Response::Query(QueryResponse::new(fields, rows)))
}

// ---------------------------------------------------------------------------
// Simple query protocol
// ---------------------------------------------------------------------------

#[async_trait]
impl SimpleQueryHandler for RvbbitHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        tracing::debug!(query, "simple query");
        Ok(vec![self.execute_sql(query, "simple").await?])
    }
}

// ---------------------------------------------------------------------------
// Extended query protocol
// ---------------------------------------------------------------------------

/// Stores the raw SQL; the engine parses during execution. Parameter types
/// come from the client's Parse message, falling back to `$n::type` casts,
/// then VARCHAR.
pub struct RvbbitQueryParser;

#[async_trait]
impl QueryParser for RvbbitQueryParser {
    type Statement = ParsedSql;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        types: &[Option<Type>],
    ) -> PgWireResult<ParsedSql>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        let count = count_params(sql);
        let mut param_types = Vec::with_capacity(count);
        for i in 0..count {
            let declared = types.get(i).cloned().flatten();
            param_types.push(declared.unwrap_or_else(|| infer_param_type(sql, i + 1)));
        }
        Ok(ParsedSql {
            sql: sql.to_string(),
            param_types,
        })
    }

    fn get_parameter_types(&self, stmt: &ParsedSql) -> PgWireResult<Vec<Type>> {
        Ok(stmt.param_types.clone())
    }

    fn get_result_schema(
        &self,
        _stmt: &ParsedSql,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        // Schema is determined at describe/execute time.
        Ok(vec![])
    }
}

fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 {
                if let Ok(n) = sql[i + 1..j].parse::<usize>() {
                    max = max.max(n);
                }
            }
            i = j;
        } else {
            i += 1;
        }
    }
    max
}

fn infer_param_type(sql: &str, index: usize) -> Type {
    let marker = format!("${index}::");
    if let Some(pos) = sql.find(&marker) {
        let rest = &sql[pos + marker.len()..];
        let type_name: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        return match type_name.to_ascii_lowercase().as_str() {
            "int" | "int4" | "integer" => Type::INT4,
            "int8" | "bigint" => Type::INT8,
            "int2" | "smallint" => Type::INT2,
            "float4" | "real" => Type::FLOAT4,
            "float8" | "double" => Type::FLOAT8,
            "bool" | "boolean" => Type::BOOL,
            _ => Type::VARCHAR,
        };
    }
    Type::VARCHAR
}

/// Substitute bound parameters as SQL literals. Casts are stripped first
/// (token-aware, so string literals are untouched), then parameters are
/// inlined in descending index order so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<ParsedSql>) -> PgWireResult<String> {
    let mut sql = strip_simple_casts(&portal.statement.statement.sql);
    let types = &portal.statement.parameter_types;
    for index in (0..portal.parameter_len()).rev() {
        let ty = types.get(index).cloned().unwrap_or(Type::VARCHAR);
        let literal = param_literal(portal, index, &ty)?;
        sql = sql.replace(&format!("${}", index + 1), &literal);
    }
    Ok(sql)
}

fn param_literal(portal: &Portal<ParsedSql>, index: usize, ty: &Type) -> PgWireResult<String> {
    let quoted = |s: String| format!("'{}'", s.replace('\'', "''"));
    let literal = match *ty {
        Type::INT2 => portal
            .parameter::<i16>(index, ty)?
            .map(|v| v.to_string()),
        Type::INT4 => portal
            .parameter::<i32>(index, ty)?
            .map(|v| v.to_string()),
        Type::INT8 => portal
            .parameter::<i64>(index, ty)?
            .map(|v| v.to_string()),
        Type::FLOAT4 => portal
            .parameter::<f32>(index, ty)?
            .map(|v| v.to_string()),
        Type::FLOAT8 => portal
            .parameter::<f64>(index, ty)?
            .map(|v| v.to_string()),
        Type::BOOL => portal
            .parameter::<bool>(index, ty)?
            .map(|v| if v { "1".to_string() } else { "0".to_string() }),
        _ => portal.parameter::<String>(index, ty)?.map(quoted),
    };
    Ok(literal.unwrap_or_else(|| "NULL".to_string()))
}

/// Remove `::type` cast suffixes, token-aware: casts inside string literals
/// are left alone.
fn strip_simple_casts(sql: &str) -> String {
    use rvbbit_sql::token::{tokenize, TokenKind};
    let tokens = tokenize(sql);
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        if token.kind == TokenKind::Symbol && token.text == "::" {
            // Skip the cast and its type name.
            if let Some(next) = tokens.get(i + 1) {
                if next.kind == TokenKind::Word {
                    i += 2;
                    continue;
                }
            }
            i += 1;
            continue;
        }
        out.push_str(&token.text);
        i += 1;
    }
    out
}

#[async_trait]
impl ExtendedQueryHandler for RvbbitHandler {
    type Statement = ParsedSql;
    type QueryParser = RvbbitQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        Arc::new(RvbbitQueryParser)
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<ParsedSql>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = ParsedSql>,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        let sql = substitute_params(portal)?;
        tracing::debug!(sql, "extended query");

        // Describe may already have run this statement.
        {
            let mut cache = self.describe_cache.lock().await;
            if let Some(result) = cache.remove(&sql) {
                return encode_result(result);
            }
        }
        self.execute_sql(&sql, "extended").await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        statement: &StoredStatement<ParsedSql>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = ParsedSql>,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        let parsed = &statement.statement;
        // Learn the result shape by running with NULL parameters; only
        // row-returning statements are safe to probe this way.
        let mut probe = parsed.sql.clone();
        for index in (1..=parsed.param_types.len()).rev() {
            probe = probe.replace(&format!("${index}"), "NULL");
        }
        let probe = strip_simple_casts(&probe);

        let fields = if is_row_returning(&catalog::normalize(&probe)) && parsed.param_types.is_empty()
        {
            // No parameters: the probe result doubles as the Execute result.
            self.describe_and_cache(&probe).await?
        } else if is_row_returning(&catalog::normalize(&probe)) {
            let caller = self.caller_for(&probe, "extended");
            let outcome = with_caller(caller, self.executor.execute(&catalog::normalize(&probe)))
                .await
                .map_err(|e| sql_error(e.to_string()))?;
            match outcome {
                ExecOutcome::Rows(result) => varchar_fields(&result.columns),
                other => varchar_fields(&other.into_result().columns),
            }
        } else {
            vec![]
        };

        Ok(DescribeStatementResponse::new(
            parsed.param_types.clone(),
            fields,
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        portal: &Portal<ParsedSql>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = ParsedSql>,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        let sql = substitute_params(portal)?;
        {
            let cache = self.describe_cache.lock().await;
            if let Some(result) = cache.get(&sql) {
                return Ok(DescribePortalResponse::new(varchar_fields(&result.columns)));
            }
        }
        let fields = self.describe_and_cache(&sql).await?;
        if fields.is_empty() {
            return Ok(DescribePortalResponse::no_data());
        }
        Ok(DescribePortalResponse::new(fields))
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// No-auth startup: negotiate, save parameters, announce a clean
/// server_version.
pub struct RvbbitStartupHandler;

#[async_trait]
impl StartupHandler for RvbbitStartupHandler {
    async fn on_startup<C>(
        &self,
        client: &mut C,
        message: pgwire::messages::PgWireFrontendMessage,
    ) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        if let pgwire::messages::PgWireFrontendMessage::Startup(ref startup) = message {
            pgwire::api::auth::protocol_negotiation(client, startup).await?;
            pgwire::api::auth::save_startup_parameters_to_metadata(client, startup);

            let mut params = DefaultServerParameterProvider::default();
            params.server_version = catalog::SERVER_VERSION.to_string();
            params.date_style = "ISO, MDY".to_string();

            pgwire::api::auth::finish_authentication(client, &params).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-connection factory
// ---------------------------------------------------------------------------

/// Handler bundle for one accepted connection.
pub struct ConnectionHandler {
    handler: Arc<RvbbitHandler>,
    startup: Arc<RvbbitStartupHandler>,
}

impl ConnectionHandler {
    pub fn new(executor: Arc<SqlExecutor>) -> Self {
        Self {
            handler: Arc::new(RvbbitHandler::new(executor)),
            startup: Arc::new(RvbbitStartupHandler),
        }
    }
}

impl PgWireServerHandlers for ConnectionHandler {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.startup.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_counting() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("SELECT $1, $2"), 2);
        assert_eq!(count_params("SELECT $2"), 2);
        assert_eq!(count_params("SELECT '$1'"), 1); // conservative: raw scan
    }

    #[test]
    fn param_type_inference() {
        assert_eq!(infer_param_type("SELECT $1::int", 1), Type::INT4);
        assert_eq!(infer_param_type("SELECT $1::bigint", 1), Type::INT8);
        assert_eq!(infer_param_type("SELECT $1::float8", 1), Type::FLOAT8);
        assert_eq!(infer_param_type("SELECT $1::bool", 1), Type::BOOL);
        assert_eq!(infer_param_type("SELECT $1", 1), Type::VARCHAR);
    }

    #[test]
    fn cast_stripping_is_string_safe() {
        assert_eq!(strip_simple_casts("SELECT 42::int4"), "SELECT 42");
        assert_eq!(strip_simple_casts("SELECT a::text, b"), "SELECT a, b");
        assert_eq!(strip_simple_casts("SELECT 'a::b'"), "SELECT 'a::b'");
    }
}
