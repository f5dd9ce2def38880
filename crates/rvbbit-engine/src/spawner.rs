//! Bridges the registry's cascade-skill contract onto the scheduler, so
//! discovered cascades and `map_cascade`-style tools dispatch sub-workflows.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use rvbbit_core::caller::InvocationMetadata;
use rvbbit_core::Result;
use rvbbit_registry::CascadeSpawner;

use crate::echo::CascadeStatus;
use crate::scheduler::{current_depth, Scheduler, SpawnLink};

/// [`CascadeSpawner`] backed by a [`Scheduler`].
pub struct SchedulerSpawner {
    scheduler: Scheduler,
}

impl SchedulerSpawner {
    pub fn new(scheduler: Scheduler) -> Arc<Self> {
        Arc::new(Self { scheduler })
    }
}

#[async_trait]
impl CascadeSpawner for SchedulerSpawner {
    async fn spawn(&self, path: PathBuf, inputs: Value) -> Result<Value> {
        let (caller_id, metadata) = match rvbbit_core::caller::current() {
            Some(ctx) => (Some(ctx.caller_id), ctx.metadata),
            None => (None, InvocationMetadata::default()),
        };
        let link = SpawnLink {
            caller_id,
            metadata,
            depth: current_depth() + 1,
            parent_session: None,
        };
        let outcome = self.scheduler.run_sub_file(path, inputs, link).await?;
        Ok(json!({
            "session_id": outcome.session_id,
            "status": outcome.status,
            "outputs": Value::Object(outcome.outputs),
        }))
    }
}

impl SchedulerSpawner {
    /// Convenience used by callers that need the outcome status surfaced as
    /// an error.
    pub async fn spawn_checked(&self, path: PathBuf, inputs: Value) -> Result<Value> {
        let result = self.spawn(path, inputs).await?;
        if result["status"] == json!(CascadeStatus::Failed) {
            return Err(rvbbit_core::Error::Other(format!(
                "sub-cascade failed: {}",
                result["session_id"]
            )));
        }
        Ok(result)
    }
}
