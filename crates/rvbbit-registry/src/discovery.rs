//! Cascade discovery: scan directories for cascade YAML files that declare a
//! `sql_function:` or `tackle:` block and register each as a skill whose
//! callable spawns the cascade as a sub-workflow.
//!
//! The registry never executes cascades itself; a [`CascadeSpawner`]
//! (implemented by the scheduler) is injected so discovery stays free of an
//! engine dependency.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use walkdir::WalkDir;

use rvbbit_core::config::{load_cascade, CascadeDef};
use rvbbit_core::tools::CachePolicy;
use rvbbit_core::{Result, Tool, ToolInput};

use crate::{SkillOrigin, SkillRegistry};

/// Dispatches a cascade file with inputs and returns its final output.
#[async_trait]
pub trait CascadeSpawner: Send + Sync {
    async fn spawn(&self, path: PathBuf, inputs: serde_json::Value) -> Result<serde_json::Value>;
}

/// A skill backed by a cascade file.
pub struct CascadeSkill {
    name: String,
    description: String,
    schema: serde_json::Value,
    cache_policy: Option<CachePolicy>,
    path: PathBuf,
    spawner: Arc<dyn CascadeSpawner>,
}

impl CascadeSkill {
    pub fn from_def(
        def: &CascadeDef,
        path: PathBuf,
        spawner: Arc<dyn CascadeSpawner>,
    ) -> Self {
        let (name, description, cache) = match (&def.tackle, &def.sql_function) {
            (Some(tackle), _) => (
                tackle.name.clone().unwrap_or_else(|| def.cascade_id.clone()),
                tackle
                    .description
                    .clone()
                    .unwrap_or_else(|| def.description.clone()),
                tackle.cache,
            ),
            (None, Some(sql)) => (sql.name.clone(), def.description.clone(), sql.cache),
            (None, None) => (def.cascade_id.clone(), def.description.clone(), false),
        };

        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (input, spec) in &def.inputs_schema {
            properties.insert(
                input.clone(),
                json!({
                    "type": if spec.type_name.is_empty() { "string" } else { spec.type_name.as_str() },
                    "description": spec.description,
                }),
            );
            if spec.required {
                required.push(input.clone());
            }
        }

        Self {
            name,
            description,
            schema: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
            cache_policy: cache.then(|| CachePolicy::with_ttl(3600)),
            path,
            spawner,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Tool for CascadeSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn args_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn cache_policy(&self) -> Option<CachePolicy> {
        self.cache_policy.clone()
    }

    async fn call(&self, input: ToolInput) -> Result<String> {
        let output = self.spawner.spawn(self.path.clone(), input.to_json()).await?;
        Ok(output.to_string())
    }
}

/// Scan `root` recursively for cascade YAML files declaring `sql_function:`
/// or `tackle:` and register each. Returns the registered skill names. Files
/// that fail to parse are skipped with a warning.
pub fn discover_cascades(
    registry: &SkillRegistry,
    spawner: Arc<dyn CascadeSpawner>,
    root: &Path,
) -> Result<Vec<String>> {
    let mut registered = Vec::new();
    let _guard = registry.reload_guard();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("cascade discovery: {e}");
                continue;
            }
        };
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !entry.file_type().is_file() || !is_yaml {
            continue;
        }

        let def = match load_cascade(path) {
            Ok(def) => def,
            Err(e) => {
                tracing::warn!(path = %path.display(), "skipping invalid cascade: {e}");
                continue;
            }
        };
        if def.sql_function.is_none() && def.tackle.is_none() {
            continue;
        }

        let skill = CascadeSkill::from_def(&def, path.to_path_buf(), spawner.clone());
        let name = skill.name().to_string();
        match registry.register(Arc::new(skill), SkillOrigin::Cascade) {
            Ok(()) => registered.push(name),
            Err(e) => tracing::warn!(path = %path.display(), "cascade registration failed: {e}"),
        }
    }
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSpawner {
        calls: Mutex<Vec<(PathBuf, serde_json::Value)>>,
    }

    #[async_trait]
    impl CascadeSpawner for RecordingSpawner {
        async fn spawn(
            &self,
            path: PathBuf,
            inputs: serde_json::Value,
        ) -> Result<serde_json::Value> {
            self.calls.lock().push((path, inputs.clone()));
            Ok(json!({ "echoed": inputs }))
        }
    }

    const TACKLE_CASCADE: &str = r#"
cascade_id: greeter
description: "Greets a person"
tackle:
  name: greet
  description: "Say hello"
inputs_schema:
  who:
    type: string
    required: true
cells:
  - name: say
    kind: agent
    instructions: "Say hello to {{ inputs.who }}"
"#;

    const PLAIN_CASCADE: &str = r#"
cascade_id: not_a_skill
cells:
  - name: only
    kind: agent
    instructions: "nothing to register"
"#;

    #[tokio::test]
    async fn discovers_and_dispatches_tackle_cascades() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("greeter.yaml"), TACKLE_CASCADE).unwrap();
        std::fs::write(tmp.path().join("plain.yaml"), PLAIN_CASCADE).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "not yaml").unwrap();

        let registry = SkillRegistry::new();
        let spawner = Arc::new(RecordingSpawner {
            calls: Mutex::new(Vec::new()),
        });
        let names = discover_cascades(&registry, spawner.clone(), tmp.path()).unwrap();
        assert_eq!(names, vec!["greet".to_string()]);

        let tool = registry.get("greet").unwrap();
        let schema = tool.args_schema();
        assert_eq!(schema["required"][0], "who");

        let out = tool
            .call(ToolInput::Structured(json!({"who": "ada"})))
            .await
            .unwrap();
        assert!(out.contains("ada"));
        assert_eq!(spawner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn rediscovery_replaces_under_reload_guard() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("greeter.yaml"), TACKLE_CASCADE).unwrap();

        let registry = SkillRegistry::new();
        let spawner = Arc::new(RecordingSpawner {
            calls: Mutex::new(Vec::new()),
        });
        discover_cascades(&registry, spawner.clone(), tmp.path()).unwrap();
        // Second scan re-registers the same name without error.
        let names = discover_cascades(&registry, spawner, tmp.path()).unwrap();
        assert_eq!(names.len(), 1);
    }
}
