//! # RVBBIT SQL
//!
//! The SQL surface of the engine:
//!
//! - a token-based **rewriter** that turns semantic operators (`MEANS`,
//!   `ABOUT`, `EXTRACTS`, `VECTOR_SEARCH`, `RVBBIT MAP/RUN/EMBED`, ...) into
//!   deterministic UDF calls, without ever matching inside string or comment
//!   literals;
//! - a narrow **OLAP adapter** over the embedded SQL engine, with UDF
//!   registration hooks (SQLite-backed by default);
//! - the **LLM UDF bridge**, whose registered functions re-enter the cascade
//!   scheduler per row with caching, coalescing, and caller-context
//!   propagation;
//! - an **executor** routing statements and directives, one per OLAP session.

pub mod bridge;
pub mod executor;
pub mod olap;
pub mod rewrite;
pub mod token;
pub mod vector;

pub use bridge::{SemanticFn, UdfBridge};
pub use executor::{ExecOutcome, OlapCellRunner, SqlExecutor};
pub use olap::{OlapEngine, QueryResult, SqliteEngine};
pub use rewrite::{union_all_split, Directive, Rewritten, SqlRewriter};
pub use vector::{InMemoryVectorStore, VectorStore};
