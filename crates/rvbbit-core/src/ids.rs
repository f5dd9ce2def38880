//! Identifier helpers.
//!
//! Session ids are UUIDv4; event trace ids are ULIDs so the event log sorts
//! by creation time lexicographically.

use ulid::Ulid;
use uuid::Uuid;

/// New cascade-execution session id.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// New event trace id (ULID, time-ordered).
pub fn new_trace_id() -> String {
    Ulid::new().to_string()
}

/// Caller id for a SQL-originated request.
pub fn new_sql_caller_id() -> String {
    format!("sql-{}", &Uuid::new_v4().simple().to_string()[..12])
}
