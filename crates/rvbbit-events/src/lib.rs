//! # RVBBIT Events
//!
//! The unified observability log: an append-only stream of typed events
//! feeding two coordinated sinks behind one single-writer queue:
//!
//! - a **columnar sink** — rolled Parquet files under `logs/echoes/` for
//!   analytics ("SELECT SUM(cost) WHERE caller_id = ..."), and
//! - a **JSONL sink** — one newline-delimited file per session under
//!   `logs/echoes_jsonl/` for replaying a single execution.
//!
//! Producers call [`EventLog::log`], which never blocks and never fails.
//! Hierarchical caller tracking: every event carries both the `session_id`
//! of its cascade execution and the `caller_id` of the originating request,
//! so costs of N sub-cascades spawned by one SQL statement roll up.

mod columnar;
mod event;
mod jsonl;
mod log;

pub use columnar::ColumnarFilter;
pub use event::{Event, NodeKind};
pub use log::{EventLog, EventLogConfig};

use std::sync::OnceLock;

static GLOBAL: OnceLock<EventLog> = OnceLock::new();

/// Install the process-wide event log. First caller wins.
pub fn install(log: EventLog) -> &'static EventLog {
    GLOBAL.get_or_init(|| log)
}

/// The process-wide event log, if one was installed.
pub fn global() -> Option<&'static EventLog> {
    GLOBAL.get()
}
