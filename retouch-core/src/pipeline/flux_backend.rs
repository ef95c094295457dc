//! Shared FLUX component stack used by both pipeline variants.
//!
//! Text encoders and the autoencoder are loaded once at construction; the
//! flux transformer itself is loaded lazily and cached per checkpoint path,
//! since the task-resolved checkpoint overlay can change between invocations
//! while the rest of the stack stays put.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp};
use candle_nn::Module;
use candle_transformers::models::clip::text_model::{self, ClipTextTransformer};
use candle_transformers::models::flux::{self, autoencoder::AutoEncoder, model::Flux};
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::sync::Api;
use image::{DynamicImage, GrayImage};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::device::{select_best_device, tensor_to_image, DeviceMap};
use crate::pipeline::InvocationRequest;

const T5_TOKEN_LEN: usize = 256;
const MIN_DIM: usize = 256;
const MAX_DIM: usize = 1440;

/// Where base transformer weights come from when no checkpoint overlay is
/// requested.
#[derive(Debug, Clone)]
pub enum TransformerSource {
    /// A single safetensors file fetched from the hub.
    HubFile { repo: String, file: String },
    /// A local directory holding diffusers-style safetensors shards.
    LocalDir(PathBuf),
}

/// Which flux configuration to instantiate the transformer/autoencoder with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FluxVariant {
    #[default]
    Dev,
    Schnell,
}

/// Hub coordinates for the text-encoder stack. The defaults match the
/// repositories the FLUX reference setup uses.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TextStackConfig {
    pub t5_repo: String,
    pub t5_revision: String,
    pub t5_tokenizer_repo: String,
    pub t5_tokenizer_file: String,
    pub clip_repo: String,
}

impl Default for TextStackConfig {
    fn default() -> Self {
        Self {
            t5_repo: "google/t5-v1_1-xxl".to_string(),
            t5_revision: "refs/pr/2".to_string(),
            t5_tokenizer_repo: "lmz/mt5-tokenizers".to_string(),
            t5_tokenizer_file: "t5-v1_1-xxl.tokenizer.json".to_string(),
            clip_repo: "openai/clip-vit-large-patch14".to_string(),
        }
    }
}

struct LoadedTransformer {
    checkpoint_path: String,
    model: Flux,
}

pub struct FluxComponents {
    api: Api,
    device: Device,
    dtype: DType,
    variant: FluxVariant,
    t5_model: Mutex<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: Mutex<AutoEncoder>,
    transformer: Mutex<Option<LoadedTransformer>>,
    source: TransformerSource,
}

impl FluxComponents {
    pub fn load(
        device_map: DeviceMap,
        variant: FluxVariant,
        text: &TextStackConfig,
        source: TransformerSource,
    ) -> Result<Self> {
        let api = Api::new().context("failed to create hub API")?;

        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();

        // --- Load T5 Model and Tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            text.t5_repo.clone(),
            hf_hub::RepoType::Model,
            text.t5_revision.clone(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo.get("config.json").context("failed to get T5 config")?;
        let config_str =
            fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model(text.t5_tokenizer_repo.clone())
            .get(&text.t5_tokenizer_file)
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- Load CLIP Model and Tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(text.clip_repo.clone()));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = text_model::ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Load Autoencoder ---
        let ae_repo = match variant {
            FluxVariant::Dev => "black-forest-labs/FLUX.1-dev",
            FluxVariant::Schnell => "black-forest-labs/FLUX.1-schnell",
        };
        let ae_file = api
            .repo(hf_hub::Repo::model(ae_repo.to_string()))
            .get("ae.safetensors")
            .context("failed to get autoencoder model file")?;
        let ae_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[ae_file], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let ae_config = match variant {
            FluxVariant::Dev => flux::autoencoder::Config::dev(),
            FluxVariant::Schnell => flux::autoencoder::Config::schnell(),
        };
        let autoencoder =
            AutoEncoder::new(&ae_config, ae_vb).context("failed to load autoencoder")?;

        Ok(Self {
            api,
            device,
            dtype,
            variant,
            t5_model: Mutex::new(t5_model),
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder: Mutex::new(autoencoder),
            transformer: Mutex::new(None),
            source,
        })
    }

    fn transformer_files(&self, checkpoint_path: &str) -> Result<Vec<PathBuf>> {
        if !checkpoint_path.is_empty() {
            let path = PathBuf::from(checkpoint_path);
            if !path.exists() {
                bail!("checkpoint {checkpoint_path:?} does not exist");
            }
            return Ok(vec![path]);
        }
        match &self.source {
            TransformerSource::HubFile { repo, file } => {
                let path = self
                    .api
                    .repo(hf_hub::Repo::model(repo.clone()))
                    .get(file)
                    .with_context(|| format!("failed to get transformer weights from {repo}"))?;
                Ok(vec![path])
            }
            TransformerSource::LocalDir(dir) => {
                let mut shards: Vec<_> = fs::read_dir(dir)
                    .with_context(|| format!("failed to read weight dir {}", dir.display()))?
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
                    .collect();
                shards.sort();
                if shards.is_empty() {
                    bail!("no safetensors shards found in {}", dir.display());
                }
                Ok(shards)
            }
        }
    }

    fn load_transformer(&self, checkpoint_path: &str) -> Result<Flux> {
        let files = self.transformer_files(checkpoint_path)?;
        tracing::info!(checkpoint = %checkpoint_path, shards = files.len(), "loading flux transformer");
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&files, self.dtype, &self.device)
                .context("failed to build flux var builder")?
        };
        let config = match self.variant {
            FluxVariant::Dev => flux::model::Config::dev(),
            FluxVariant::Schnell => flux::model::Config::schnell(),
        };
        Flux::new(&config, vb).context("failed to load flux transformer")
    }

    /// Runs the sampling loop and returns the generated image.
    pub fn generate(&self, request: &InvocationRequest) -> Result<DynamicImage> {
        let width = clamp_dim(request.output_width);
        let height = clamp_dim(request.output_height);
        let steps = request.sample_steps;

        self.device.set_seed(request.seed)?;

        // --- Generate noise image ---
        let noise_img =
            flux::sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;

        // --- Compute T5 embedding ---
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_TOKEN_LEN, 0);
        let input_token_ids = candle_core::Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self
            .t5_model
            .lock()
            .map_err(|_| Error::msg("t5 lock poisoned"))?
            .forward(&input_token_ids)?;

        // --- Compute CLIP embedding ---
        let clip_tokens = self
            .clip_tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip =
            candle_core::Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        // --- Create sampling state and schedule ---
        let sampling_state = flux::sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = flux::sampling::get_schedule(steps, None);

        // --- Run denoising, loading the transformer for this checkpoint ---
        let latent_img = {
            let mut guard = self
                .transformer
                .lock()
                .map_err(|_| Error::msg("transformer lock poisoned"))?;
            let stale = guard
                .as_ref()
                .is_none_or(|t| t.checkpoint_path != request.checkpoint_path);
            if stale {
                // Drop the previous overlay before loading the next one so
                // both never reside on the device at once.
                *guard = None;
                let model = self.load_transformer(&request.checkpoint_path)?;
                *guard = Some(LoadedTransformer {
                    checkpoint_path: request.checkpoint_path.clone(),
                    model,
                });
            }
            let transformer = guard.as_ref().map(|t| &t.model).ok_or_else(|| {
                Error::msg("flux transformer unavailable after load")
            })?;
            flux::sampling::denoise(
                transformer,
                &sampling_state.img,
                &sampling_state.img_ids,
                &sampling_state.txt,
                &sampling_state.txt_ids,
                &sampling_state.vec,
                &timesteps,
                request.guide_scale,
            )?
        };

        let unpacked = flux::sampling::unpack(&latent_img, height, width)?;

        // --- Decode the latent image ---
        let decoded = self
            .autoencoder
            .lock()
            .map_err(|_| Error::msg("autoencoder lock poisoned"))?
            .decode(&unpacked)?;

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let generated = tensor_to_image(&img.i(0)?)?;

        // Paste-back: outside the mask the source pixels survive untouched;
        // inside, the repainting scale controls how much of the generated
        // content replaces them.
        match (&request.edit_image, &request.edit_mask) {
            (Some(edit), Some(mask)) => Ok(paste_back(
                &generated,
                edit,
                mask,
                request.repainting_scale,
            )),
            _ => Ok(generated),
        }
    }

    /// Drops device-resident transformer weights. Text encoders and the
    /// autoencoder are freed when the instance itself is dropped.
    pub fn release(&self) {
        if let Ok(mut guard) = self.transformer.lock() {
            *guard = None;
        }
        tracing::info!("released flux transformer weights");
    }
}

fn clamp_dim(dim: usize) -> usize {
    dim.clamp(MIN_DIM, MAX_DIM) / 16 * 16
}

/// Blends `generated` over `edit` using the mask's coverage scaled by
/// `repainting_scale`.
pub(crate) fn paste_back(
    generated: &DynamicImage,
    edit: &DynamicImage,
    mask: &GrayImage,
    repainting_scale: f32,
) -> DynamicImage {
    let (width, height) = (generated.width(), generated.height());
    let edit = edit
        .resize_exact(width, height, image::imageops::FilterType::Lanczos3)
        .to_rgb8();
    let mask = image::imageops::resize(mask, width, height, image::imageops::FilterType::Nearest);
    let generated = generated.to_rgb8();
    let scale = repainting_scale.clamp(0.0, 1.0);

    let mut out = edit;
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let alpha = f32::from(mask.get_pixel(x, y)[0]) / 255.0 * scale;
        let gen = generated.get_pixel(x, y);
        for c in 0..3 {
            let blended = f32::from(gen[c]) * alpha + f32::from(pixel[c]) * (1.0 - alpha);
            pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    DynamicImage::ImageRgb8(out)
}
