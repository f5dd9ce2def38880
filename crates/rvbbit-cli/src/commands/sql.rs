//! `rvbbit sql query "<SQL>"` — local query convenience.

use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Subcommand};

use rvbbit_sql::{ExecOutcome, SqlExecutor, SqliteEngine, UdfBridge};

use crate::bootstrap;

#[derive(Subcommand)]
pub enum SqlCommand {
    /// Execute one SQL statement and print the result
    Query(QueryArgs),
    /// Show how a statement rewrites (without executing it)
    Rewrite(QueryArgs),
}

#[derive(Args)]
pub struct QueryArgs {
    /// The SQL statement (semantic operators allowed)
    pub sql: String,

    /// Database file to run against (in-memory when unset)
    #[arg(long)]
    pub database: Option<std::path::PathBuf>,
}

pub async fn execute(command: SqlCommand) -> Result<()> {
    match command {
        SqlCommand::Query(args) => query(args).await,
        SqlCommand::Rewrite(args) => rewrite(args).await,
    }
}

async fn query(args: QueryArgs) -> Result<()> {
    let runtime = bootstrap::runtime().await?;
    let engine: Arc<dyn rvbbit_sql::OlapEngine> = match &args.database {
        Some(path) => Arc::new(SqliteEngine::open(path).await?),
        None => Arc::new(SqliteEngine::open_in_memory().await?),
    };
    let bridge = UdfBridge::new(runtime.scheduler.clone());
    let executor = SqlExecutor::new(engine, bridge, runtime.rewriter.clone()).await?;

    match executor.execute(&args.sql).await? {
        ExecOutcome::Rows(result) => {
            println!("{}", result.columns.join("\t"));
            for row in &result.rows {
                let cells: Vec<String> = row
                    .iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    })
                    .collect();
                println!("{}", cells.join("\t"));
            }
            eprintln!("({} rows)", result.rows.len());
        }
        ExecOutcome::Affected(n) => eprintln!("ok ({n} rows affected)"),
        ExecOutcome::Handle(id) => println!("{id}"),
        ExecOutcome::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
    }

    runtime.events.close().await;
    Ok(())
}

async fn rewrite(args: QueryArgs) -> Result<()> {
    let runtime = bootstrap::runtime().await?;
    match runtime.rewriter.read().rewrite(&args.sql)? {
        rvbbit_sql::Rewritten::Query {
            sql,
            warnings,
            parallel,
            ..
        } => {
            println!("{sql}");
            for warning in warnings {
                eprintln!("warning: {warning}");
            }
            if let Some(n) = parallel {
                eprintln!("parallel: {n} branches");
            }
        }
        rvbbit_sql::Rewritten::Directive(directive) => {
            println!("{directive:?}");
        }
    }
    Ok(())
}
