//! The interactive editing session: everything the user-facing form talks
//! to, minus the rendering itself.
//!
//! A `Studio` owns both registries, the growing edit-type state and the
//! pipeline lifecycle manager. Each user action maps to one method: pick a
//! model, pick a task, render.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use candle_core::Device;
use image::{DynamicImage, GrayImage};

use crate::config::{ModelRegistry, TaskModelRegistry};
use crate::device::{select_best_device, DeviceMap};
use crate::edit_types::EditTypeRegistry;
use crate::error::RequestError;
use crate::invoke::{invoke, InvocationOutcome, SamplingParams};
use crate::lifecycle::PipelineManager;
use crate::normalize::{normalize, EditPayload};
use crate::pipeline::{default_builder, InputDefaults, PipelineBuilder};
use crate::preprocess::PreprocessorHub;

/// One user interaction, fully described.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub prompt: String,
    pub reference_image: Option<DynamicImage>,
    pub edit_payload: Option<EditPayload>,
    pub task_type: String,
    pub edit_type: String,
    pub sampling: SamplingParams,
}

/// The generated image plus what the form shows back to the user: the
/// effective preprocessed inputs and a diagnostic line.
#[derive(Debug)]
pub struct RenderOutput {
    pub image: DynamicImage,
    pub preview_image: Option<DynamicImage>,
    pub preview_mask: Option<GrayImage>,
    pub seed: u64,
    pub elapsed_seconds: f64,
    pub info: String,
}

pub struct Studio {
    models: Arc<ModelRegistry>,
    tasks: TaskModelRegistry,
    edit_types: Mutex<EditTypeRegistry>,
    hub: PreprocessorHub,
    manager: PipelineManager,
    device: Device,
}

impl Studio {
    /// Loads both registries, eagerly registers every task's edit types and
    /// brings up the default model's pipeline. Any failure here is fatal.
    pub fn open(
        model_dir: impl AsRef<Path>,
        task_models_path: impl AsRef<Path>,
        device_map: DeviceMap,
    ) -> Result<Self> {
        Self::with_builder(
            model_dir,
            task_models_path,
            default_builder(device_map),
            select_best_device(device_map)?,
        )
    }

    /// Like [`Studio::open`] but with an injected pipeline builder, which is
    /// how tests avoid constructing real device-backed pipelines.
    pub fn with_builder(
        model_dir: impl AsRef<Path>,
        task_models_path: impl AsRef<Path>,
        builder: PipelineBuilder,
        device: Device,
    ) -> Result<Self> {
        let models = Arc::new(ModelRegistry::load(model_dir)?);
        let tasks = TaskModelRegistry::load(task_models_path)?;

        let mut edit_types = EditTypeRegistry::new();
        for task in tasks.iter() {
            edit_types.register_task(task);
        }

        let manager = PipelineManager::new(models.clone(), builder)
            .context("failed to bring up the default pipeline")?;

        Ok(Self {
            models,
            tasks,
            edit_types: Mutex::new(edit_types),
            hub: PreprocessorHub::with_builtins(),
            manager,
            device,
        })
    }

    pub fn model_names(&self) -> &[String] {
        self.models.names()
    }

    pub fn current_model(&self) -> String {
        self.manager.current_name()
    }

    pub fn task_names(&self) -> &[String] {
        self.tasks.names()
    }

    pub fn edit_type_names(&self) -> Vec<String> {
        self.lock_edit_types().resolve().to_vec()
    }

    pub fn repainting_scale_for(&self, edit_type: &str) -> f32 {
        self.lock_edit_types().repainting_scale_for(edit_type)
    }

    /// Registers external preprocessor kinds next to the built-ins.
    pub fn preprocessors_mut(&mut self) -> &mut PreprocessorHub {
        &mut self.hub
    }

    /// Hot-swaps the active pipeline. On an unknown name the previous model
    /// stays in effect and the error doubles as the user-visible notice.
    pub fn select_model(&self, model_name: &str) -> Result<InputDefaults, RequestError> {
        let active = self.manager.swap_to(model_name)?;
        Ok(active.pipeline.input_defaults().clone())
    }

    /// (Re)selects a task, idempotently folding its edit types into the
    /// global list, and returns that list.
    pub fn select_task(&self, task_type: &str) -> Result<Vec<String>, RequestError> {
        let task = self
            .tasks
            .get(task_type)
            .ok_or_else(|| RequestError::UnknownTask(task_type.to_string()))?;
        let mut edit_types = self.lock_edit_types();
        edit_types.register_task(task);
        Ok(edit_types.resolve().to_vec())
    }

    /// Runs one edit request end to end: resolve the task's checkpoint and
    /// the edit type's preprocessor, normalize the inputs, invoke the
    /// currently active pipeline.
    pub fn render(&self, request: &RenderRequest) -> Result<RenderOutput, RequestError> {
        let task = self
            .tasks
            .get(&request.task_type)
            .ok_or_else(|| RequestError::UnknownTask(request.task_type.clone()))?;

        let edit_spec = {
            let mut edit_types = self.lock_edit_types();
            // Guaranteed no-op when the task was selected before; it keeps a
            // direct render-without-selection consistent.
            edit_types.register_task(task);
            match edit_types.get(&request.edit_type) {
                None => {
                    return Err(RequestError::InvalidInput(format!(
                        "unknown edit type {:?}",
                        request.edit_type
                    )))
                }
                Some(spec) => spec.cloned(),
            }
        };

        let inputs = normalize(
            request.reference_image.as_ref(),
            request.edit_payload.as_ref(),
            edit_spec.as_ref(),
            &self.hub,
            &self.device,
        )?;

        // What the form echoes back: the preprocessed edit image when there
        // is one, otherwise the reference.
        let preview_image = inputs
            .edit_image
            .clone()
            .or_else(|| inputs.reference_image.clone());
        let preview_mask = inputs.edit_mask.clone();

        let active = self.manager.current();
        let InvocationOutcome {
            image,
            seed,
            elapsed_seconds,
            info,
        } = invoke(
            active.pipeline.as_ref(),
            &request.prompt,
            inputs,
            &request.sampling,
            &task.model_path,
        )?;

        Ok(RenderOutput {
            image,
            preview_image,
            preview_mask,
            seed,
            elapsed_seconds,
            info,
        })
    }

    fn lock_edit_types(&self) -> std::sync::MutexGuard<'_, EditTypeRegistry> {
        self.edit_types
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
