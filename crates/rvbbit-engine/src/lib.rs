//! # RVBBIT Engine
//!
//! The execution core: the agent turn-loop (prompt → response → tools →
//! feedback), per-cell context assembly with retention and TTL, and the
//! cascade scheduler that sequences cells, fans out candidates, selects
//! winners, reforges, and spawns sub-cascades.
//!
//! The scheduler is a cooperative driver: one supervisor task owns the
//! [`Echo`](echo::Echo) for a session, workers return structured results via
//! channels, and every component publishes to the unified event log.

pub mod agent;
pub mod context;
pub mod echo;
pub mod events;
pub mod extraction;
pub mod mutations;
pub mod scheduler;
pub mod spawner;

pub use agent::{AgentLoop, AgentOutcome};
pub use echo::{CascadeOutcome, CascadeStatus, Echo};
pub use events::EventScope;
pub use scheduler::{
    current_depth, DefaultModelFactory, ModelFactory, Scheduler, SchedulerConfig, SpawnLink,
    SqlCellRunner, StaticModelFactory,
};
pub use spawner::SchedulerSpawner;
