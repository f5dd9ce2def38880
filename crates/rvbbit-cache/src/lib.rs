//! # RVBBIT Result Cache
//!
//! Content-addressed cache for tool results.
//!
//! | Concern | Mechanism |
//! |---------|-----------|
//! | Key | SHA-256 over `tool_name ∥ canonical-JSON(args projected per policy)` |
//! | TTL | checked on `get`; expired entries count as misses and are evicted |
//! | Capacity | LRU; every hit promotes, inserts evict the oldest |
//! | Invalidation | entries record their policy's event names; `invalidate(event)` purges |
//! | Concurrency | per-key async mutex; concurrent builds for one fingerprint coalesce |
//!
//! The coalescing path matters under SQL row dispatch: a cold cache plus 10k
//! identical rows must produce one underlying build, not 10k.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use rvbbit_core::tools::{CachePolicy, KeySpec};
use rvbbit_core::{Error, Result};

/// A registered custom key function for [`KeySpec::Custom`].
pub type KeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Counters exposed by [`ResultCache::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    /// `get_or_build` calls that waited on another caller's build.
    pub coalesced: u64,
    pub size: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    tool: String,
    result: Value,
    stored_at: Instant,
    ttl: Duration,
    invalidate_on: Vec<String>,
    hit_count: u64,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

/// The process-wide result cache.
pub struct ResultCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    stats: Mutex<CacheStats>,
    key_fns: RwLock<HashMap<String, KeyFn>>,
    builds: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            stats: Mutex::new(CacheStats::default()),
            key_fns: RwLock::new(HashMap::new()),
            builds: DashMap::new(),
        }
    }

    /// Register a key function usable from `KeySpec::Custom`.
    pub fn register_key_fn(&self, name: impl Into<String>, f: KeyFn) {
        self.key_fns.write().insert(name.into(), f);
    }

    /// Compute the fingerprint for a (tool, args) pair under a policy.
    pub fn fingerprint(&self, tool: &str, args: &Value, policy: &CachePolicy) -> Result<String> {
        let projected = match &policy.key {
            KeySpec::ArgsHash => canonical_json(args),
            KeySpec::Query => named_arg(args, "query")?,
            KeySpec::SqlHash => named_arg(args, "sql")?,
            KeySpec::Custom(name) => {
                let fns = self.key_fns.read();
                let f = fns.get(name).ok_or_else(|| {
                    Error::Other(format!("unknown cache key function '{name}'"))
                })?;
                f(args)
            }
        };
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update([0]);
        hasher.update(projected.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Look up a cached result. Expired entries are evicted and count as
    /// misses.
    pub fn get(&self, tool: &str, args: &Value, policy: &CachePolicy) -> Result<Option<Value>> {
        let key = self.fingerprint(tool, args, policy)?;
        Ok(self.lookup(&key))
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        self.lookup_inner(key, true)
    }

    /// Lookup without touching hit/miss counters; used for the post-lock
    /// recheck in `get_or_build` so one logical miss counts once.
    fn lookup_quiet(&self, key: &str) -> Option<Value> {
        self.lookup_inner(key, false)
    }

    fn lookup_inner(&self, key: &str, count_stats: bool) -> Option<Value> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired() => {
                entries.pop(key);
                let mut stats = self.stats.lock();
                if count_stats {
                    stats.misses += 1;
                }
                stats.expirations += 1;
                stats.size = entries.len() as u64;
                None
            }
            Some(entry) => {
                entry.hit_count += 1;
                let value = entry.result.clone();
                if count_stats {
                    self.stats.lock().hits += 1;
                }
                Some(value)
            }
            None => {
                if count_stats {
                    self.stats.lock().misses += 1;
                }
                None
            }
        }
    }

    /// Store a result.
    pub fn set(
        &self,
        tool: &str,
        args: &Value,
        policy: &CachePolicy,
        result: Value,
    ) -> Result<()> {
        let key = self.fingerprint(tool, args, policy)?;
        self.insert(key, tool, policy, result);
        Ok(())
    }

    fn insert(&self, key: String, tool: &str, policy: &CachePolicy, result: Value) {
        let entry = CacheEntry {
            tool: tool.to_string(),
            result,
            stored_at: Instant::now(),
            ttl: Duration::from_secs(policy.ttl_secs),
            invalidate_on: policy.invalidate_on.clone(),
            hit_count: 0,
        };
        let mut entries = self.entries.lock();
        let evicted = entries.push(key.clone(), entry);
        let mut stats = self.stats.lock();
        if let Some((old_key, _)) = evicted {
            // push() returns the displaced LRU entry when at capacity, or
            // the previous value for the same key (not an eviction).
            if old_key != key {
                stats.evictions += 1;
            }
        }
        stats.size = entries.len() as u64;
    }

    /// Fetch-or-compute with in-flight coalescing: concurrent callers for the
    /// same fingerprint produce exactly one underlying build.
    pub async fn get_or_build<F, Fut>(
        &self,
        tool: &str,
        args: &Value,
        policy: &CachePolicy,
        build: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        let key = self.fingerprint(tool, args, policy)?;

        if let Some(v) = self.lookup(&key) {
            return Ok(v);
        }

        let lock = self
            .builds
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        // A concurrent build may have completed while we waited.
        if let Some(v) = self.lookup_quiet(&key) {
            self.stats.lock().coalesced += 1;
            drop(guard);
            self.builds.remove(&key);
            return Ok(v);
        }

        let result = build().await;
        drop(guard);
        self.builds.remove(&key);

        let value = result?;
        self.insert(key, tool, policy, value.clone());
        Ok(value)
    }

    /// Remove every entry whose policy listed this invalidation event.
    pub fn invalidate(&self, event_name: &str) -> usize {
        let mut entries = self.entries.lock();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.invalidate_on.iter().any(|n| n == event_name))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        let mut stats = self.stats.lock();
        stats.invalidations += keys.len() as u64;
        stats.size = entries.len() as u64;
        keys.len()
    }

    /// Drop all entries, or only those belonging to one tool.
    pub fn clear(&self, tool: Option<&str>) {
        let mut entries = self.entries.lock();
        match tool {
            None => entries.clear(),
            Some(tool) => {
                let keys: Vec<String> = entries
                    .iter()
                    .filter(|(_, e)| e.tool == tool)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in keys {
                    entries.pop(&key);
                }
            }
        }
        self.stats.lock().size = entries.len() as u64;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }
}

/// Stable JSON serialization: object keys sorted recursively so logically
/// identical argument maps hash identically.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[key.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

fn named_arg(args: &Value, name: &str) -> Result<String> {
    args.get(name)
        .map(canonical_json)
        .ok_or_else(|| Error::Other(format!("cache key policy requires a '{name}' argument")))
}

// Process-wide singleton, initialized lazily on first use.
static GLOBAL: std::sync::OnceLock<ResultCache> = std::sync::OnceLock::new();

/// The process-wide cache (10k entries).
pub fn global() -> &'static ResultCache {
    GLOBAL.get_or_init(|| ResultCache::new(10_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(ttl_secs: u64) -> CachePolicy {
        CachePolicy::with_ttl(ttl_secs)
    }

    #[test]
    fn set_then_get_within_ttl() {
        let cache = ResultCache::new(16);
        let p = policy(60);
        let args = json!({"text": "Jane Doe", "what": "first_name"});
        cache.set("extract", &args, &p, json!("Jane")).unwrap();
        let got = cache.get("extract", &args, &p).unwrap();
        assert_eq!(got, Some(json!("Jane")));
    }

    #[test]
    fn canonical_json_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn query_policy_projects_only_query_arg() {
        let cache = ResultCache::new(16);
        let p = CachePolicy {
            ttl_secs: 60,
            key: KeySpec::Query,
            invalidate_on: vec![],
        };
        let a = json!({"query": "geese", "page": 1});
        let b = json!({"query": "geese", "page": 2});
        cache.set("search", &a, &p, json!(["r1"])).unwrap();
        // Same query, different page: same fingerprint, so this hits.
        assert_eq!(cache.get("search", &b, &p).unwrap(), Some(json!(["r1"])));
    }

    #[test]
    fn custom_key_fn() {
        let cache = ResultCache::new(16);
        cache.register_key_fn(
            "first_char",
            Arc::new(|args: &Value| {
                args.get("text")
                    .and_then(|t| t.as_str())
                    .and_then(|s| s.chars().next())
                    .map(|c| c.to_string())
                    .unwrap_or_default()
            }),
        );
        let p = CachePolicy {
            ttl_secs: 60,
            key: KeySpec::Custom("first_char".into()),
            invalidate_on: vec![],
        };
        cache
            .set("t", &json!({"text": "alpha"}), &p, json!(1))
            .unwrap();
        assert_eq!(
            cache.get("t", &json!({"text": "avocado"}), &p).unwrap(),
            Some(json!(1))
        );
        assert_eq!(cache.get("t", &json!({"text": "beta"}), &p).unwrap(), None);
    }

    #[test]
    fn ttl_expiry_counts_as_miss() {
        let cache = ResultCache::new(16);
        let p = policy(0); // expires immediately
        let args = json!({"x": 1});
        cache.set("t", &args, &p, json!(42)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get("t", &args, &p).unwrap(), None);
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = ResultCache::new(2);
        let p = policy(60);
        cache.set("t", &json!({"k": 1}), &p, json!(1)).unwrap();
        cache.set("t", &json!({"k": 2}), &p, json!(2)).unwrap();
        // Touch k=1 so k=2 becomes LRU.
        assert!(cache.get("t", &json!({"k": 1}), &p).unwrap().is_some());
        cache.set("t", &json!({"k": 3}), &p, json!(3)).unwrap();

        assert!(cache.get("t", &json!({"k": 1}), &p).unwrap().is_some());
        assert!(cache.get("t", &json!({"k": 2}), &p).unwrap().is_none());
        assert!(cache.get("t", &json!({"k": 3}), &p).unwrap().is_some());
    }

    #[test]
    fn invalidate_by_event_name() {
        let cache = ResultCache::new(16);
        let p = CachePolicy {
            ttl_secs: 600,
            key: KeySpec::ArgsHash,
            invalidate_on: vec!["index_updated".into()],
        };
        let other = policy(600);
        cache.set("search", &json!({"q": 1}), &p, json!(1)).unwrap();
        cache.set("misc", &json!({"q": 2}), &other, json!(2)).unwrap();

        let removed = cache.invalidate("index_updated");
        assert_eq!(removed, 1);
        assert_eq!(cache.get("search", &json!({"q": 1}), &p).unwrap(), None);
        assert_eq!(
            cache.get("misc", &json!({"q": 2}), &other).unwrap(),
            Some(json!(2))
        );
    }

    #[test]
    fn clear_scoped_to_tool() {
        let cache = ResultCache::new(16);
        let p = policy(600);
        cache.set("a", &json!({"k": 1}), &p, json!(1)).unwrap();
        cache.set("b", &json!({"k": 1}), &p, json!(2)).unwrap();
        cache.clear(Some("a"));
        assert_eq!(cache.get("a", &json!({"k": 1}), &p).unwrap(), None);
        assert!(cache.get("b", &json!({"k": 1}), &p).unwrap().is_some());
        cache.clear(None);
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn concurrent_builds_coalesce_to_one() {
        let cache = Arc::new(ResultCache::new(16));
        let p = policy(600);
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let p = p.clone();
            let builds = builds.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build("classify", &json!({"text": "same"}), &p, || async {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(json!("label"))
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), json!("label"));
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_build_is_not_cached() {
        let cache = ResultCache::new(16);
        let p = policy(600);
        let err = cache
            .get_or_build("t", &json!({"k": 1}), &p, || async {
                Err(Error::Other("boom".into()))
            })
            .await;
        assert!(err.is_err());
        let ok = cache
            .get_or_build("t", &json!({"k": 1}), &p, || async { Ok(json!(7)) })
            .await
            .unwrap();
        assert_eq!(ok, json!(7));
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = ResultCache::new(16);
        let p = policy(600);
        let args = json!({"name": "Jane Doe"});
        assert!(cache.get("extract", &args, &p).unwrap().is_none());
        cache.set("extract", &args, &p, json!("Jane")).unwrap();
        assert!(cache.get("extract", &args, &p).unwrap().is_some());
        assert!(cache.get("extract", &args, &p).unwrap().is_some());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.size, 1);
    }
}
