//! # RVBBIT Skill Registry
//!
//! Name → callable mapping for everything a cell can invoke: builtin tools,
//! discovered cascades, and remote MCP tools. Names are globally unique
//! within a process; the origin of each skill determines its dispatch path.
//!
//! Re-registration is only allowed for cascade-origin skills while a reload
//! guard is held (hot-reload of cascade directories).

pub mod builtin;
pub mod discovery;
pub mod manifest;
pub mod mcp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use rvbbit_core::{Error, Result, Tool};

pub use discovery::{discover_cascades, CascadeSpawner};
pub use manifest::{manifest_select, Embedder, LexicalEmbedder};
pub use mcp::{discover_mcp, McpServerConfig};

/// Where a skill came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillOrigin {
    Builtin,
    Cascade,
    Mcp,
    Declarative,
}

/// A registered skill.
#[derive(Clone)]
pub struct SkillEntry {
    pub origin: SkillOrigin,
    pub tool: Arc<dyn Tool>,
}

/// Summary row for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub origin: SkillOrigin,
}

/// The process-wide skill registry.
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, SkillEntry>>,
    reload_lock: Mutex<()>,
    reloading: AtomicBool,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            skills: RwLock::new(HashMap::new()),
            reload_lock: Mutex::new(()),
            reloading: AtomicBool::new(false),
        }
    }

    /// Register a skill. Fails on a name collision unless both the existing
    /// and new entry have cascade origin and a reload guard is held.
    pub fn register(&self, tool: Arc<dyn Tool>, origin: SkillOrigin) -> Result<()> {
        let name = tool.name().to_string();
        let mut skills = self.skills.write();
        if let Some(existing) = skills.get(&name) {
            let reloadable = existing.origin == SkillOrigin::Cascade
                && origin == SkillOrigin::Cascade
                && self.reloading.load(Ordering::Acquire);
            if !reloadable {
                return Err(Error::Other(format!(
                    "skill name collision: '{name}' is already registered ({:?})",
                    existing.origin
                )));
            }
        }
        skills.insert(name, SkillEntry { origin, tool });
        Ok(())
    }

    /// Take the reload guard: cascade-origin skills may be re-registered
    /// while it is held.
    pub fn reload_guard(&self) -> ReloadGuard<'_> {
        let guard = self.reload_lock.lock();
        self.reloading.store(true, Ordering::Release);
        ReloadGuard {
            registry: self,
            _guard: guard,
        }
    }

    /// Look up a skill by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.skills
            .read()
            .get(name)
            .map(|e| e.tool.clone())
            .ok_or_else(|| Error::UnknownSkill(name.to_string()))
    }

    pub fn entry(&self, name: &str) -> Option<SkillEntry> {
        self.skills.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.skills.read().contains_key(name)
    }

    /// List skills, optionally filtered by a name/description substring.
    pub fn list(&self, filter: Option<&str>) -> Vec<SkillInfo> {
        let skills = self.skills.read();
        let mut out: Vec<SkillInfo> = skills
            .values()
            .filter(|e| match filter {
                Some(f) => {
                    let f = f.to_lowercase();
                    e.tool.name().to_lowercase().contains(&f)
                        || e.tool.description().to_lowercase().contains(&f)
                }
                None => true,
            })
            .map(|e| SkillInfo {
                name: e.tool.name().to_string(),
                description: e.tool.description().to_string(),
                origin: e.origin,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.skills.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.read().is_empty()
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while cascade skills are re-registered.
pub struct ReloadGuard<'a> {
    registry: &'a SkillRegistry,
    _guard: parking_lot::MutexGuard<'a, ()>,
}

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.registry.reloading.store(false, Ordering::Release);
    }
}

// Process-wide singleton, initialized lazily with the builtin tools.
static GLOBAL: std::sync::OnceLock<Arc<SkillRegistry>> = std::sync::OnceLock::new();

/// The process-wide registry, with builtins installed.
pub fn global() -> Arc<SkillRegistry> {
    GLOBAL
        .get_or_init(|| {
            let registry = Arc::new(SkillRegistry::new());
            builtin::register_builtins(&registry);
            registry
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rvbbit_core::ToolInput;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test tool"
        }
        async fn call(&self, _input: ToolInput) -> Result<String> {
            Ok("ok".into())
        }
    }

    #[test]
    fn register_and_get() {
        let reg = SkillRegistry::new();
        reg.register(Arc::new(Named("alpha")), SkillOrigin::Builtin)
            .unwrap();
        assert!(reg.get("alpha").is_ok());
        assert!(matches!(
            reg.get("missing").unwrap_err(),
            Error::UnknownSkill(_)
        ));
    }

    #[test]
    fn collision_rejected_without_reload_guard() {
        let reg = SkillRegistry::new();
        reg.register(Arc::new(Named("dup")), SkillOrigin::Cascade)
            .unwrap();
        assert!(reg
            .register(Arc::new(Named("dup")), SkillOrigin::Cascade)
            .is_err());
    }

    #[test]
    fn cascade_reregistration_under_guard() {
        let reg = SkillRegistry::new();
        reg.register(Arc::new(Named("casc")), SkillOrigin::Cascade)
            .unwrap();
        {
            let _guard = reg.reload_guard();
            reg.register(Arc::new(Named("casc")), SkillOrigin::Cascade)
                .unwrap();
            // Builtin origin still cannot steal the name.
            assert!(reg
                .register(Arc::new(Named("casc")), SkillOrigin::Builtin)
                .is_err());
        }
        // Guard dropped: collisions rejected again.
        assert!(reg
            .register(Arc::new(Named("casc")), SkillOrigin::Cascade)
            .is_err());
    }

    #[test]
    fn list_filters_by_substring() {
        let reg = SkillRegistry::new();
        reg.register(Arc::new(Named("shell")), SkillOrigin::Builtin)
            .unwrap();
        reg.register(Arc::new(Named("http_get")), SkillOrigin::Builtin)
            .unwrap();
        let all = reg.list(None);
        assert_eq!(all.len(), 2);
        let filtered = reg.list(Some("shell"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "shell");
    }
}
