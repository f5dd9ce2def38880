//! Shared process setup: the event log, the skill registry, the scheduler,
//! and cascade discovery.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use rvbbit_core::env_vars;
use rvbbit_engine::{DefaultModelFactory, Scheduler, SchedulerSpawner};
use rvbbit_events::{EventLog, EventLogConfig};
use rvbbit_sql::SqlRewriter;

/// Root directory for cascades and logs.
pub fn root_dir() -> PathBuf {
    env_vars::env_string(env_vars::ROOT)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

pub fn log_dir() -> PathBuf {
    env_vars::env_string(env_vars::LOG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| root_dir().join("logs"))
}

pub fn cascade_dir() -> PathBuf {
    root_dir().join("cascades")
}

/// Path of the MCP server configuration file.
pub fn mcp_config_path() -> PathBuf {
    root_dir().join("mcp.json")
}

/// A wired-up engine: scheduler, event log, shared rewriter.
pub struct Runtime {
    pub scheduler: Scheduler,
    pub events: EventLog,
    pub rewriter: Arc<RwLock<SqlRewriter>>,
}

/// Build the process runtime: start the event log, install builtins,
/// discover cascades (registering both skills and SQL operators).
pub async fn runtime() -> Result<Runtime> {
    let events = EventLog::start(EventLogConfig::new(log_dir()))?;
    rvbbit_events::install(events.clone());

    let registry = rvbbit_registry::global();
    let cache = Arc::new(rvbbit_cache::ResultCache::new(10_000));
    let models = Arc::new(DefaultModelFactory::new());
    let scheduler = Scheduler::new(registry.clone(), cache, events.clone(), models);

    let rewriter = Arc::new(RwLock::new(SqlRewriter::new()));

    // Cascade discovery: skills for tackle/sql_function cascades, operator
    // templates for the rewriter.
    let cascades = cascade_dir();
    if cascades.is_dir() {
        let spawner = SchedulerSpawner::new(scheduler.clone());
        match rvbbit_registry::discover_cascades(&registry, spawner, &cascades) {
            Ok(names) => {
                if !names.is_empty() {
                    tracing::info!(count = names.len(), "registered cascade skills");
                }
            }
            Err(e) => tracing::warn!("cascade discovery failed: {e}"),
        }
        register_sql_operators(&rewriter, &cascades);
    }

    Ok(Runtime {
        scheduler,
        events,
        rewriter,
    })
}

fn register_sql_operators(rewriter: &Arc<RwLock<SqlRewriter>>, dir: &std::path::Path) {
    for entry in walk_yaml(dir) {
        let Ok(def) = rvbbit_core::config::load_cascade(&entry) else {
            continue;
        };
        if let Some(spec) = &def.sql_function {
            if let Err(e) = rewriter.write().register_sql_function(spec) {
                tracing::warn!(path = %entry.display(), "operator registration failed: {e}");
            }
        }
    }
}

fn walk_yaml(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_yaml(&path));
        } else if path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    out
}
