//! Invocation coordination: one fully resolved call into the active
//! pipeline, timed, with a diagnostic line for the caller.

use std::time::Instant;

use image::DynamicImage;
use rand::Rng;

use crate::error::RequestError;
use crate::normalize::NormalizedInputs;
use crate::pipeline::{InvocationRequest, Pipeline, Sampler};

/// User-adjustable sampling knobs. `seed = -1` requests a fresh random seed
/// at invocation time.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub sample_steps: usize,
    pub guide_scale: f64,
    pub seed: i64,
    pub output_height: usize,
    pub output_width: usize,
    pub repainting_scale: f32,
}

#[derive(Debug)]
pub struct InvocationOutcome {
    pub image: DynamicImage,
    pub seed: u64,
    pub elapsed_seconds: f64,
    pub info: String,
}

pub fn resolve_seed(seed: i64) -> u64 {
    if seed < 0 {
        rand::rng().random_range(0..=u64::from(u32::MAX))
    } else {
        seed as u64
    }
}

/// Dispatches one inference call. The sampler is pinned to flow-euler; the
/// checkpoint path comes from the selected task, not the selected model.
/// Pipeline failures are propagated unchanged and never retried.
pub fn invoke(
    pipeline: &dyn Pipeline,
    prompt: &str,
    inputs: NormalizedInputs,
    sampling: &SamplingParams,
    checkpoint_path: &str,
) -> Result<InvocationOutcome, RequestError> {
    let request = InvocationRequest {
        prompt: prompt.to_string(),
        reference_image: inputs.reference_image,
        edit_image: inputs.edit_image,
        edit_mask: inputs.edit_mask,
        output_height: sampling.output_height,
        output_width: sampling.output_width,
        sampler: Sampler::FlowEuler,
        sample_steps: sampling.sample_steps,
        guide_scale: sampling.guide_scale,
        seed: resolve_seed(sampling.seed),
        repainting_scale: sampling.repainting_scale,
        checkpoint_path: checkpoint_path.to_string(),
    };

    let started = Instant::now();
    let (image, seed) = pipeline
        .invoke(&request)
        .map_err(RequestError::Inference)?;
    let elapsed_seconds = started.elapsed().as_secs_f64();

    let info = format!("prompt: {prompt}; seed: {seed}; cost time: {elapsed_seconds:.2}s");
    tracing::info!(%seed, elapsed_seconds, "invocation finished");

    Ok(InvocationOutcome {
        image,
        seed,
        elapsed_seconds,
        info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::InputDefaults;
    use anyhow::anyhow;
    use std::sync::Mutex;

    struct RecordingPipeline {
        defaults: InputDefaults,
        seen: Mutex<Option<InvocationRequest>>,
        fail: bool,
    }

    impl RecordingPipeline {
        fn new(fail: bool) -> Self {
            Self {
                defaults: InputDefaults::default(),
                seen: Mutex::new(None),
                fail,
            }
        }
    }

    impl Pipeline for RecordingPipeline {
        fn invoke(&self, request: &InvocationRequest) -> anyhow::Result<(DynamicImage, u64)> {
            *self.seen.lock().unwrap() = Some(request.clone());
            if self.fail {
                return Err(anyhow!("out of device memory"));
            }
            Ok((DynamicImage::new_rgb8(2, 2), request.seed))
        }

        fn release(&self) {}

        fn input_defaults(&self) -> &InputDefaults {
            &self.defaults
        }
    }

    fn sampling(seed: i64) -> SamplingParams {
        SamplingParams {
            sample_steps: 8,
            guide_scale: 4.5,
            seed,
            output_height: 512,
            output_width: 512,
            repainting_scale: 1.0,
        }
    }

    #[test]
    fn explicit_seed_is_used_verbatim() {
        assert_eq!(resolve_seed(42), 42);
        assert_eq!(resolve_seed(0), 0);
    }

    #[test]
    fn negative_seed_resolves_to_a_random_one() {
        // Not a randomness test, only that the sentinel never leaks through.
        let seed = resolve_seed(-1);
        assert!(seed <= u64::from(u32::MAX));
    }

    #[test]
    fn call_contract_carries_task_checkpoint_and_fixed_sampler() {
        let pipeline = RecordingPipeline::new(false);
        let outcome = invoke(
            &pipeline,
            "replace the sky",
            NormalizedInputs::default(),
            &sampling(42),
            "ckpt/portrait.safetensors",
        )
        .unwrap();

        let seen = pipeline.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.sampler, Sampler::FlowEuler);
        assert_eq!(seen.checkpoint_path, "ckpt/portrait.safetensors");
        assert_eq!(seen.seed, 42);
        assert_eq!(outcome.seed, 42);
        assert!(outcome.elapsed_seconds >= 0.0);
        assert!(outcome.info.starts_with("prompt: replace the sky; seed: 42;"));
    }

    #[test]
    fn pipeline_failure_propagates_as_inference_error() {
        let pipeline = RecordingPipeline::new(true);
        let err = invoke(
            &pipeline,
            "p",
            NormalizedInputs::default(),
            &sampling(1),
            "",
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::Inference(_)));
    }
}
