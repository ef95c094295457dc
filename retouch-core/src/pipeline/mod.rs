//! The inference-pipeline boundary.
//!
//! The orchestrator only ever sees `dyn Pipeline`: construct from a model
//! config, invoke, release. The closed set of concrete implementations is
//! selected by `InferenceKind` at construction time and nowhere else.

use std::sync::Arc;

use anyhow::Result;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::device::DeviceMap;

mod ace;
mod ace_diffusers;
mod flux_backend;

pub use ace::AcePlusPipeline;
pub use ace_diffusers::AceDiffusersPipeline;

/// Which pipeline implementation a model document selects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceKind {
    #[default]
    AcePlus,
    AceDiffusers,
}

serde_plain::derive_display_from_serialize!(InferenceKind);
serde_plain::derive_fromstr_from_deserialize!(InferenceKind);

/// Sampler selection is fixed per build, not user-configurable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampler {
    #[default]
    FlowEuler,
}

serde_plain::derive_display_from_serialize!(Sampler);

/// Default sampling inputs a model surfaces to the caller (sliders pick up
/// these values whenever the active model changes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputDefaults {
    pub sample_steps: usize,
    pub guide_scale: f64,
    pub output_height: usize,
    pub output_width: usize,
    pub repainting_scale: f32,
}

impl Default for InputDefaults {
    fn default() -> Self {
        Self {
            sample_steps: 20,
            guide_scale: 4.5,
            output_height: 1024,
            output_width: 1024,
            repainting_scale: 1.0,
        }
    }
}

/// The fully resolved call contract for one inference run.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    pub reference_image: Option<DynamicImage>,
    pub edit_image: Option<DynamicImage>,
    pub edit_mask: Option<GrayImage>,
    pub output_height: usize,
    pub output_width: usize,
    pub sampler: Sampler,
    pub sample_steps: usize,
    pub guide_scale: f64,
    pub seed: u64,
    pub repainting_scale: f32,
    /// Task-resolved checkpoint overlay, applied on top of the active base
    /// model. Empty means "base weights only".
    pub checkpoint_path: String,
}

/// Capability contract every pipeline variant satisfies.
pub trait Pipeline: Send + Sync {
    /// Runs one generation and returns the image together with the seed it
    /// was produced from.
    fn invoke(&self, request: &InvocationRequest) -> Result<(DynamicImage, u64)>;

    /// Drops device/accelerator resources ahead of the instance itself being
    /// dropped. Called exactly once by the lifecycle manager during a swap.
    fn release(&self);

    fn input_defaults(&self) -> &InputDefaults;
}

/// Constructor injected into the lifecycle manager. The default one
/// dispatches on the model's `inference_kind` tag; tests substitute mocks.
pub type PipelineBuilder = Arc<dyn Fn(&ModelConfig) -> Result<Arc<dyn Pipeline>> + Send + Sync>;

/// The production builder: tagged-variant dispatch at construction time only.
pub fn default_builder(device_map: DeviceMap) -> PipelineBuilder {
    Arc::new(move |cfg: &ModelConfig| -> Result<Arc<dyn Pipeline>> {
        tracing::info!(model = %cfg.name, kind = %cfg.inference_kind, "constructing pipeline");
        match cfg.inference_kind {
            InferenceKind::AcePlus => Ok(Arc::new(AcePlusPipeline::from_config(cfg, device_map)?)),
            InferenceKind::AceDiffusers => {
                Ok(Arc::new(AceDiffusersPipeline::from_config(cfg, device_map)?))
            }
        }
    })
}
