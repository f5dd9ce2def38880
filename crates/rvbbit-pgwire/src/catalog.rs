//! pg_catalog emulation.
//!
//! On connect, views presenting the PostgreSQL catalog shape are created
//! over the embedded engine's native schema tables, and catalog-specific
//! function calls are answered with constants so off-the-shelf clients can
//! introspect without a real PostgreSQL behind them.

use rvbbit_core::Result;
use rvbbit_sql::OlapEngine;

/// Server version reported to clients.
pub const SERVER_VERSION: &str = "16.6";

/// Create the pg_catalog-shaped views over the engine's native schema.
pub async fn install_views(engine: &dyn OlapEngine) -> Result<()> {
    let statements = [
        // Namespaces: the two every client expects.
        "CREATE VIEW IF NOT EXISTS pg_namespace AS \
         SELECT 11 AS oid, 'pg_catalog' AS nspname \
         UNION ALL SELECT 2200, 'public'",
        // Relations over the native master table.
        "CREATE VIEW IF NOT EXISTS pg_class AS \
         SELECT rowid AS oid, name AS relname, 2200 AS relnamespace, \
                CASE type WHEN 'view' THEN 'v' ELSE 'r' END AS relkind \
         FROM sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'pg_%'",
        // Columns via the table_info pragma.
        "CREATE VIEW IF NOT EXISTS pg_attribute AS \
         SELECT m.rowid AS attrelid, p.name AS attname, p.cid + 1 AS attnum, \
                25 AS atttypid, 0 AS atttypmod, 0 AS attisdropped \
         FROM sqlite_master m, pragma_table_info(m.name) p \
         WHERE m.type = 'table' AND m.name NOT LIKE 'pg_%'",
        "CREATE VIEW IF NOT EXISTS pg_tables AS \
         SELECT 'public' AS schemaname, name AS tablename, 'rvbbit' AS tableowner \
         FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'pg_%'",
        // The types clients actually look up.
        "CREATE VIEW IF NOT EXISTS pg_type AS \
         SELECT 16 AS oid, 'bool' AS typname, 11 AS typnamespace \
         UNION ALL SELECT 20, 'int8', 11 \
         UNION ALL SELECT 23, 'int4', 11 \
         UNION ALL SELECT 25, 'text', 11 \
         UNION ALL SELECT 701, 'float8', 11 \
         UNION ALL SELECT 1043, 'varchar', 11 \
         UNION ALL SELECT 1114, 'timestamp', 11",
        "CREATE VIEW IF NOT EXISTS pg_database AS \
         SELECT 1 AS oid, 'rvbbit' AS datname",
        "CREATE VIEW IF NOT EXISTS pg_proc AS \
         SELECT 0 AS oid, '' AS proname, 11 AS pronamespace WHERE 0",
        "CREATE VIEW IF NOT EXISTS pg_settings AS \
         SELECT 'server_version' AS name, '16.6' AS setting \
         UNION ALL SELECT 'server_encoding', 'UTF8' \
         UNION ALL SELECT 'client_encoding', 'UTF8' \
         UNION ALL SELECT 'DateStyle', 'ISO, MDY'",
        // Present but empty.
        "CREATE VIEW IF NOT EXISTS pg_index AS \
         SELECT 0 AS indexrelid, 0 AS indrelid WHERE 0",
        "CREATE VIEW IF NOT EXISTS pg_description AS \
         SELECT 0 AS objoid, '' AS description WHERE 0",
    ];
    for statement in statements {
        engine.execute(statement).await?;
    }
    Ok(())
}

/// Constant answer for a catalog function call, if the statement is one.
pub fn constant_answer(sql: &str) -> Option<(String, String)> {
    let lower = sql.trim().trim_end_matches(';').to_lowercase();
    let single = |name: &str, value: &str| Some((name.to_string(), value.to_string()));

    if lower == "select version()" {
        return single(
            "version",
            &format!("PostgreSQL {SERVER_VERSION} (rvbbit {})", env!("CARGO_PKG_VERSION")),
        );
    }
    if lower == "select current_database()" {
        return single("current_database", "rvbbit");
    }
    if lower == "select current_schema()" || lower == "select current_schema" {
        return single("current_schema", "public");
    }
    if lower == "select pg_backend_pid()" {
        return single("pg_backend_pid", &std::process::id().to_string());
    }
    if lower.starts_with("select has_table_privilege") {
        return single("has_table_privilege", "t");
    }
    None
}

/// Normalize client SQL for the embedded engine: strip schema prefixes and
/// `::regclass`-style casts PostgreSQL clients sprinkle over catalog
/// queries.
pub fn normalize(sql: &str) -> String {
    let mut out = sql
        .replace("pg_catalog.", "")
        .replace("\"pg_catalog\".", "")
        .replace("public.", "")
        .replace("\"public\".", "");
    for cast in ["::regclass", "::regproc", "::regtype", "::oid", "::text", "::name"] {
        out = out.replace(cast, "");
    }
    out
}

/// Whether a statement is a `SET` that should be silently accepted.
pub fn is_set_statement(sql: &str) -> bool {
    sql.trim_start()
        .split_whitespace()
        .next()
        .map(|w| w.eq_ignore_ascii_case("SET"))
        .unwrap_or(false)
}

/// Transaction-control classification for ReadyForQuery bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnControl {
    Begin,
    Commit,
    Rollback,
}

pub fn txn_control(sql: &str) -> Option<TxnControl> {
    let first = sql
        .trim_start()
        .split_whitespace()
        .next()?
        .to_ascii_uppercase();
    match first.as_str() {
        "BEGIN" | "START" => Some(TxnControl::Begin),
        "COMMIT" | "END" => Some(TxnControl::Commit),
        "ROLLBACK" | "ABORT" => Some(TxnControl::Rollback),
        _ => None,
    }
}
