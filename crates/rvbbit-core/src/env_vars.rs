//! The `RVBBIT_*` environment variable surface, plus typed accessors.

use std::time::Duration;

/// Root directory for cascades, logs, and scratch space.
pub const ROOT: &str = "RVBBIT_ROOT";
/// Event log directory (defaults to `<root>/logs`).
pub const LOG_DIR: &str = "RVBBIT_LOG_DIR";
/// Default model name for agent cells without an explicit `model`.
pub const MODEL: &str = "RVBBIT_MODEL";
/// Provider API key.
pub const API_KEY: &str = "RVBBIT_API_KEY";
/// Provider base URL (chat-completions compatible endpoint).
pub const API_BASE: &str = "RVBBIT_API_BASE";
/// OLAP backend selector (`sqlite` in core).
pub const OLAP: &str = "RVBBIT_OLAP";
/// Map fan-out bound; defaults to the CPU count.
pub const MAX_PARALLEL: &str = "RVBBIT_MAX_PARALLEL";
/// Concurrent-LLM-call bound; defaults to CPU*2.
pub const MAX_LLM_CONCURRENCY: &str = "RVBBIT_MAX_LLM_CONCURRENCY";
/// Maximum sub-cascade recursion depth.
pub const MAX_DEPTH: &str = "RVBBIT_MAX_DEPTH";

pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

pub fn env_string_or_default(name: &str, default: &str) -> String {
    env_string(name).unwrap_or_else(|| default.to_string())
}

pub fn env_usize(name: &str, default: usize) -> usize {
    env_string(name)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

pub fn env_bool(name: &str, default: bool) -> bool {
    match env_string(name).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

pub fn env_duration_secs(name: &str, default: Duration) -> Duration {
    env_string(name)
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        assert_eq!(env_usize("RVBBIT_TEST_UNSET_XYZ", 7), 7);
        assert!(env_bool("RVBBIT_TEST_UNSET_XYZ", true));
        assert_eq!(
            env_duration_secs("RVBBIT_TEST_UNSET_XYZ", Duration::from_secs(3)),
            Duration::from_secs(3)
        );
        assert_eq!(env_string_or_default("RVBBIT_TEST_UNSET_XYZ", "d"), "d");
    }
}
