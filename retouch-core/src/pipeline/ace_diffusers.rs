//! The diffusers-checkout variant: transformer weights come from the sharded
//! safetensors of a local diffusers-layout directory instead of a single hub
//! file. Everything else is shared with the native pipeline.

use std::path::PathBuf;

use anyhow::{Context, Result};
use image::DynamicImage;
use serde::Deserialize;

use crate::config::ModelConfig;
use crate::device::DeviceMap;
use crate::pipeline::flux_backend::{
    FluxComponents, FluxVariant, TextStackConfig, TransformerSource,
};
use crate::pipeline::{InputDefaults, InvocationRequest, Pipeline};

#[derive(Debug, Clone, Deserialize)]
struct AceDiffusersParams {
    /// Root of the diffusers checkout; shards are expected under
    /// `<model_dir>/transformer/`.
    model_dir: PathBuf,
    #[serde(default)]
    variant: FluxVariant,
    #[serde(default)]
    text: TextStackConfig,
    #[serde(default)]
    input: InputDefaults,
}

pub struct AceDiffusersPipeline {
    components: FluxComponents,
    input: InputDefaults,
}

impl AceDiffusersPipeline {
    pub fn from_config(cfg: &ModelConfig, device_map: DeviceMap) -> Result<Self> {
        let params: AceDiffusersParams = serde_json::from_value(cfg.params.clone())
            .with_context(|| format!("invalid params for model {:?}", cfg.name))?;
        let source = TransformerSource::LocalDir(params.model_dir.join("transformer"));
        let components = FluxComponents::load(device_map, params.variant, &params.text, source)
            .with_context(|| format!("failed to load components for model {:?}", cfg.name))?;
        Ok(Self {
            components,
            input: params.input,
        })
    }
}

impl Pipeline for AceDiffusersPipeline {
    fn invoke(&self, request: &InvocationRequest) -> Result<(DynamicImage, u64)> {
        let image = self.components.generate(request)?;
        Ok((image, request.seed))
    }

    fn release(&self) {
        self.components.release();
    }

    fn input_defaults(&self) -> &InputDefaults {
        &self.input
    }
}
