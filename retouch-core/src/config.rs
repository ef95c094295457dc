//! Declarative configuration for models and editing tasks.
//!
//! Two kinds of documents feed the orchestrator: a directory of per-model
//! JSON files (one selectable pipeline variant each) and a single task-model
//! file describing every supported editing task. Both are loaded once at
//! startup and never mutated afterwards.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::pipeline::InferenceKind;

/// One selectable model variant, parsed from a single document.
///
/// `params` is carried opaquely and handed to the pipeline constructor
/// selected by `inference_kind`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub inference_kind: InferenceKind,
    #[serde(default)]
    pub params: Value,
}

/// Immutable-after-load mapping from model name to its configuration.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    configs: HashMap<String, ModelConfig>,
    order: Vec<String>,
    default_name: String,
}

impl ModelRegistry {
    /// Reads every `*.json` document in `dir`.
    ///
    /// Paths are sorted before parsing so the registry order (and the
    /// default-model fallback) does not depend on filesystem listing order.
    /// Duplicate names across documents are rejected outright rather than
    /// resolved last-wins, so a stray copy of a config cannot silently
    /// shadow the real one.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut configs = HashMap::new();
        let mut order = Vec::new();
        let mut default_name = None;
        for path in &paths {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let cfg: ModelConfig =
                serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            if configs.contains_key(&cfg.name) {
                return Err(ConfigError::DuplicateModelName(cfg.name));
            }
            if cfg.is_default && default_name.is_none() {
                default_name = Some(cfg.name.clone());
            }
            order.push(cfg.name.clone());
            configs.insert(cfg.name.clone(), cfg);
        }

        if configs.is_empty() {
            return Err(ConfigError::EmptyModelDir(dir.display().to_string()));
        }
        // No document claimed the default: the first one (in sorted path
        // order) wins.
        let default_name = default_name.unwrap_or_else(|| order[0].clone());
        tracing::info!(models = ?order, default = %default_name, "model registry loaded");

        Ok(Self {
            configs,
            order,
            default_name,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ModelConfig> {
        self.configs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }
}

/// One preprocessor entry of a task document. `kind` doubles as the edit-type
/// name. `repainting_scale` starts unset and is pinned by the edit-type
/// resolver at first registration.
#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessorSpec {
    pub kind: String,
    #[serde(default)]
    pub repainting_scale: Option<f32>,
    #[serde(default)]
    pub params: Value,
}

fn default_repainting_scale() -> f32 {
    1.0
}

/// One supported editing task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskModel {
    pub name: String,
    /// Checkpoint/LoRA overlay applied on top of the active base model when
    /// this task is invoked.
    pub model_path: String,
    #[serde(default = "default_repainting_scale")]
    pub repainting_scale: f32,
    #[serde(default)]
    pub preprocessors: Vec<PreprocessorSpec>,
}

#[derive(Debug, Deserialize)]
struct TaskModelDocument {
    tasks: Vec<TaskModel>,
}

/// Map from lower-cased task name to its `TaskModel`, keeping declaration
/// order for presentation.
#[derive(Debug, Clone)]
pub struct TaskModelRegistry {
    tasks: HashMap<String, TaskModel>,
    order: Vec<String>,
}

impl TaskModelRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let doc: TaskModelDocument =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        let mut tasks = HashMap::new();
        let mut order = Vec::new();
        for task in doc.tasks {
            let key = task.name.to_lowercase();
            if tasks.contains_key(&key) {
                return Err(ConfigError::InvalidTaskModel {
                    task: task.name,
                    reason: "declared more than once".into(),
                });
            }
            if task.model_path.is_empty() {
                return Err(ConfigError::InvalidTaskModel {
                    task: task.name,
                    reason: "model_path must not be empty".into(),
                });
            }
            order.push(key.clone());
            tasks.insert(key, task);
        }
        tracing::info!(tasks = ?order, "task models loaded");

        Ok(Self { tasks, order })
    }

    /// Lookup is case-insensitive, matching the lower-cased keying.
    pub fn get(&self, task_name: &str) -> Option<&TaskModel> {
        self.tasks.get(&task_name.to_lowercase())
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskModel> {
        self.order.iter().filter_map(|name| self.tasks.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_models_and_picks_declared_default() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.json", r#"{"name": "m1"}"#);
        write_file(
            dir.path(),
            "b.json",
            r#"{"name": "m2", "is_default": true, "inference_kind": "ace_diffusers"}"#,
        );

        let registry = ModelRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.default_name(), "m2");
        assert_eq!(registry.names(), ["m1", "m2"]);
        assert_eq!(
            registry.get("m2").unwrap().inference_kind,
            InferenceKind::AceDiffusers
        );
    }

    #[test]
    fn first_model_in_sorted_order_wins_without_declared_default() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "z.json", r#"{"name": "mz"}"#);
        write_file(dir.path(), "a.json", r#"{"name": "ma"}"#);

        let registry = ModelRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.default_name(), "ma");
    }

    #[test]
    fn empty_directory_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelRegistry::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyModelDir(_)));
    }

    #[test]
    fn duplicate_model_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.json", r#"{"name": "m1"}"#);
        write_file(dir.path(), "b.json", r#"{"name": "m1"}"#);

        let err = ModelRegistry::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateModelName(name) if name == "m1"));
    }

    #[test]
    fn task_models_are_keyed_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "tasks.json",
            r#"{"tasks": [
                {"name": "Portrait", "model_path": "ckpt/portrait.safetensors",
                 "repainting_scale": 0.5,
                 "preprocessors": [{"kind": "gray"}]}
            ]}"#,
        );

        let registry = TaskModelRegistry::load(dir.path().join("tasks.json")).unwrap();
        let task = registry.get("PORTRAIT").unwrap();
        assert_eq!(task.model_path, "ckpt/portrait.safetensors");
        assert_eq!(task.repainting_scale, 0.5);
        assert_eq!(task.preprocessors[0].kind, "gray");
        assert_eq!(registry.names(), ["portrait"]);
    }

    #[test]
    fn missing_model_path_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "tasks.json",
            r#"{"tasks": [{"name": "t1", "model_path": ""}]}"#,
        );
        let err = TaskModelRegistry::load(dir.path().join("tasks.json")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTaskModel { .. }));
    }

    #[test]
    fn non_list_preprocessors_fail_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "tasks.json",
            r#"{"tasks": [{"name": "t1", "model_path": "p", "preprocessors": "gray"}]}"#,
        );
        let err = TaskModelRegistry::load(dir.path().join("tasks.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
