//! Hierarchical caller-context propagation.
//!
//! Every external entry point (PG server, CLI, HTTP API) sets a caller
//! context for the duration of the request; the scheduler copies it into each
//! spawned `Echo` so sub-cascade events roll up under the originating
//! request. Propagation uses a tokio task-local, so it crosses `.await`
//! points but must be re-established with [`with_caller`] on spawned tasks.

use serde::{Deserialize, Serialize};
use std::future::Future;

/// Where a request came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationMetadata {
    /// `sql`, `cli`, `ui`, `api`, ...
    #[serde(default)]
    pub origin: String,
    /// Original query text for SQL-originated requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Wire protocol (`simple`, `extended`) for SQL-originated requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Caller id plus invocation metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallerContext {
    pub caller_id: String,
    #[serde(default)]
    pub metadata: InvocationMetadata,
}

impl CallerContext {
    pub fn new(caller_id: impl Into<String>, metadata: InvocationMetadata) -> Self {
        Self {
            caller_id: caller_id.into(),
            metadata,
        }
    }
}

tokio::task_local! {
    static CALLER: CallerContext;
}

/// Run `fut` with the given caller context installed.
pub async fn with_caller<F>(ctx: CallerContext, fut: F) -> F::Output
where
    F: Future,
{
    CALLER.scope(ctx, fut).await
}

/// The caller context of the current task, if one was installed.
///
/// Absence is acceptable: a top-level CLI run has no external caller, and its
/// session id doubles as the caller id.
pub fn current() -> Option<CallerContext> {
    CALLER.try_with(|c| c.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scoped_context_is_visible() {
        assert!(current().is_none());
        let ctx = CallerContext::new(
            "sql-abc",
            InvocationMetadata {
                origin: "sql".into(),
                query: Some("SELECT 1".into()),
                protocol: Some("simple".into()),
            },
        );
        let seen = with_caller(ctx.clone(), async { current() }).await;
        assert_eq!(seen, Some(ctx));
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn context_survives_await_points() {
        let ctx = CallerContext::new("cli-1", InvocationMetadata::default());
        let seen = with_caller(ctx, async {
            tokio::task::yield_now().await;
            current().map(|c| c.caller_id)
        })
        .await;
        assert_eq!(seen.as_deref(), Some("cli-1"));
    }
}
