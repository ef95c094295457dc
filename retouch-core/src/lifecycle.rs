//! Hot-swap lifecycle for the single active inference pipeline.
//!
//! One instance is live at a time. `swap_to` is the sole writer and runs its
//! release/construct/publish sequence under one exclusive lock; `current()`
//! readers take a brief read lock on the published reference and therefore
//! observe either the pre-swap or the post-swap instance, never a
//! half-constructed one.
//!
//! Known race, kept on purpose to match the observed behavior of the system
//! this replaces: an invocation that captured the active instance before a
//! swap started keeps executing while `swap_to` releases that instance's
//! device resources. Release is not gated on in-flight calls returning. A
//! per-instance reference count would close the gap but would be a behavior
//! change, so it is deliberately not implemented here.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};

use crate::config::ModelRegistry;
use crate::error::RequestError;
use crate::pipeline::{Pipeline, PipelineBuilder};

/// Snapshot of the published pipeline: the model name it was built from plus
/// the instance itself.
#[derive(Clone)]
pub struct ActivePipeline {
    pub name: String,
    pub pipeline: Arc<dyn Pipeline>,
}

impl std::fmt::Debug for ActivePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivePipeline")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub struct PipelineManager {
    registry: Arc<ModelRegistry>,
    builder: PipelineBuilder,
    /// Serializes entire swaps (release through publish), independent of the
    /// read path.
    swap_lock: Mutex<()>,
    current: RwLock<ActivePipeline>,
}

impl PipelineManager {
    /// Constructs the manager with the registry's default model live.
    /// Failure here is fatal: the process must not serve without an active
    /// pipeline.
    pub fn new(registry: Arc<ModelRegistry>, builder: PipelineBuilder) -> Result<Self> {
        let default_name = registry.default_name().to_string();
        let config = registry
            .get(&default_name)
            .context("default model missing from registry")?;
        let pipeline = (builder)(config)
            .with_context(|| format!("failed to construct default pipeline {default_name:?}"))?;
        tracing::info!(model = %default_name, "default pipeline ready");
        Ok(Self {
            registry,
            builder,
            swap_lock: Mutex::new(()),
            current: RwLock::new(ActivePipeline {
                name: default_name,
                pipeline,
            }),
        })
    }

    /// The currently published pipeline. Cheap; never blocks behind a swap's
    /// construction phase.
    pub fn current(&self) -> ActivePipeline {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn current_name(&self) -> String {
        self.current().name
    }

    /// Swaps the active pipeline to `model_name`.
    ///
    /// Unknown names are rejected without touching the active instance.
    /// Swapping to the already-active model is an idempotent no-op that
    /// returns the existing instance without any release or construction.
    pub fn swap_to(&self, model_name: &str) -> Result<ActivePipeline, RequestError> {
        let config = self
            .registry
            .get(model_name)
            .ok_or_else(|| RequestError::UnknownModel(model_name.to_string()))?;

        let _guard = self
            .swap_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Checked under the swap lock so two racing swaps to the same name
        // cannot both decide to rebuild.
        let previous = self.current();
        if previous.name == model_name {
            return Ok(previous);
        }

        tracing::info!(from = %previous.name, to = %model_name, "swapping pipeline");
        // Release first so the replacement never coexists with the old
        // instance's device allocations. In-flight invocations against the
        // displaced instance are not waited for (see module docs).
        previous.pipeline.release();

        // If construction fails the previous instance stays published. Its
        // device resources were already dropped above, which mirrors the
        // observed source behavior; the next successful swap restores a
        // usable state.
        let pipeline = (self.builder)(config).map_err(RequestError::Inference)?;

        let active = ActivePipeline {
            name: model_name.to_string(),
            pipeline,
        };
        let mut published = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *published = active.clone();
        Ok(active)
    }
}
