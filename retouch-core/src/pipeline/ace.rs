//! The native ACE++ pipeline: FLUX fill weights fetched from the hub, with
//! task checkpoints overlaid per invocation.

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
#[serde(default)]
struct AcePlusParams {
    variant: FluxVariant,
    transformer_repo: String,
    transformer_file: String,
    text: TextStackConfig,
    input: InputDefaults,
}

impl Default for AcePlusParams {
    fn default() -> Self {
        Self {
            variant: FluxVariant::Dev,
            transformer_repo: "black-forest-labs/FLUX.1-Fill-dev".to_string(),
            transformer_file: "flux1-fill-dev.safetensors".to_string(),
            text: TextStackConfig::default(),
            input: InputDefaults::default(),
        }
    }
}

pub struct AcePlusPipeline {
    components: FluxComponents,
    input: InputDefaults,
}

impl AcePlusPipeline {
    pub fn from_config(cfg: &ModelConfig, device_map: DeviceMap) -> Result<Self> {
        let params: AcePlusParams = if cfg.params.is_null() {
            AcePlusParams::default()
        } else {
            serde_json::from_value(cfg.params.clone())
                .with_context(|| format!("invalid params for model {:?}", cfg.name))?
        };
        let source = TransformerSource::HubFile {
            repo: params.transformer_repo,
            file: params.transformer_file,
        };
        let components = FluxComponents::load(device_map, params.variant, &params.text, source)
            .with_context(|| format!("failed to load components for model {:?}", cfg.name))?;
        Ok(Self {
            components,
            input: params.input,
        })
    }
}

impl Pipeline for AcePlusPipeline {
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
