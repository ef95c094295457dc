//! Task-type to edit-type resolution.
//!
//! Every task declares the preprocessors it can drive. Visiting a task folds
//! those declarations into one global registry of edit types: the merged list
//! is what the caller picks from, not a task-scoped one. Two tasks that share
//! a preprocessor kind therefore see the identical resolved entry, including
//! its `repainting_scale` — an intentional simplification, kept as-is.

use std::collections::HashMap;

use crate::config::{PreprocessorSpec, TaskModel};

/// The built-in edit type: no preprocessing, the mask is used as supplied.
pub const REPAINTING: &str = "repainting";

/// Mapping from edit-type name to its resolved preprocessor, plus the append
/// order the UI presents. `None` marks the built-in repainting entry. Grows
/// monotonically; never shrinks.
#[derive(Debug, Clone)]
pub struct EditTypeRegistry {
    specs: HashMap<String, Option<PreprocessorSpec>>,
    order: Vec<String>,
}

impl Default for EditTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EditTypeRegistry {
    pub fn new() -> Self {
        let mut specs = HashMap::new();
        specs.insert(REPAINTING.to_string(), None);
        Self {
            specs,
            order: vec![REPAINTING.to_string()],
        }
    }

    /// Folds a task's preprocessor declarations into the registry.
    ///
    /// First registration wins: a kind that is already present is skipped
    /// entirely, even when a later task declares it with different
    /// parameters or a different repainting scale. That makes this call
    /// idempotent, so it is safe both for the eager startup pass over all
    /// tasks and for every interactive task (re)selection afterwards.
    pub fn register_task(&mut self, task: &TaskModel) {
        for spec in &task.preprocessors {
            if self.specs.contains_key(&spec.kind) {
                continue;
            }
            let mut spec = spec.clone();
            if spec.repainting_scale.is_none() {
                spec.repainting_scale = Some(task.repainting_scale);
            }
            tracing::debug!(kind = %spec.kind, task = %task.name, "registered edit type");
            self.order.push(spec.kind.clone());
            self.specs.insert(spec.kind.clone(), Some(spec));
        }
    }

    /// The single merged global edit-type order, starting with
    /// [`REPAINTING`].
    pub fn resolve(&self) -> &[String] {
        &self.order
    }

    /// Outer `None`: the edit type is unknown. Inner `None`: the built-in
    /// repainting entry, which has no preprocessor.
    pub fn get(&self, edit_type: &str) -> Option<Option<&PreprocessorSpec>> {
        self.specs.get(edit_type).map(|spec| spec.as_ref())
    }

    pub fn contains(&self, edit_type: &str) -> bool {
        self.specs.contains_key(edit_type)
    }

    /// The repainting-scale slider value to surface when this edit type is
    /// selected. The built-in entry always reports full strength.
    pub fn repainting_scale_for(&self, edit_type: &str) -> f32 {
        match self.get(edit_type) {
            Some(Some(spec)) => spec.repainting_scale.unwrap_or(1.0),
            _ => 1.0,
        }
    }
}
