//! # RVBBIT Core
//!
//! Shared types for the RVBBIT orchestration engine: cascade definitions,
//! chat messages, the tool trait, the error taxonomy, caller-context
//! propagation, and template rendering.
//!
//! Everything here is dependency-light so the higher layers (events,
//! registry, cache, engine, SQL, wire server) can share one vocabulary
//! without cycles.

pub mod caller;
pub mod config;
pub mod env_vars;
pub mod error;
pub mod ids;
pub mod messages;
pub mod template;
pub mod tools;

pub use error::{Error, Result};
pub use messages::{Message, Role, ToolCall};
pub use tools::{CachePolicy, KeySpec, Tool, ToolInput};
