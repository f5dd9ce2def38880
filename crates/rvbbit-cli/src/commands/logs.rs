//! `rvbbit logs query <predicate>` / `rvbbit logs session <id>` — inspect
//! the unified event log.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use rvbbit_events::{ColumnarFilter, EventLog, EventLogConfig};

use crate::bootstrap;

#[derive(Subcommand)]
pub enum LogsCommand {
    /// Scan the columnar log with `key=value` predicates
    /// (session_id, caller_id, node_kind, cascade_id, limit)
    Query(QueryArgs),
    /// Print every event of one session, in order
    Session(SessionArgs),
}

#[derive(Args)]
pub struct QueryArgs {
    /// Predicates like `caller_id=sql-abc node_kind=error limit=50`
    pub predicates: Vec<String>,
}

#[derive(Args)]
pub struct SessionArgs {
    pub session_id: String,
}

pub async fn execute(command: LogsCommand) -> Result<()> {
    // Read-only access: no writer thread needed, but the handle API wants
    // one; reuse the standard config pointing at the log dir.
    let log = EventLog::start(EventLogConfig::new(bootstrap::log_dir()))?;

    match command {
        LogsCommand::Query(args) => {
            let filter = parse_predicates(&args.predicates)?;
            let events = log.query_columnar(&filter)?;
            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
            eprintln!("({} events)", events.len());
        }
        LogsCommand::Session(args) => {
            let events = log.query_session(&args.session_id)?;
            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
            eprintln!("({} events)", events.len());
        }
    }
    log.close().await;
    Ok(())
}

fn parse_predicates(predicates: &[String]) -> Result<ColumnarFilter> {
    let mut filter = ColumnarFilter::default();
    for predicate in predicates {
        let (key, value) = predicate
            .split_once('=')
            .with_context(|| format!("predicate {predicate:?} is not key=value"))?;
        match key {
            "session_id" => filter.session_id = Some(value.to_string()),
            "caller_id" => filter.caller_id = Some(value.to_string()),
            "node_kind" => filter.node_kind = Some(value.to_string()),
            "cascade_id" => filter.cascade_id = Some(value.to_string()),
            "limit" => filter.limit = Some(value.parse().context("limit must be a number")?),
            other => anyhow::bail!("unknown predicate key {other:?}"),
        }
    }
    Ok(filter)
}
