pub mod config;
pub mod device;
pub mod edit_types;
pub mod error;
pub mod invoke;
pub mod lifecycle;
pub mod normalize;
pub mod pipeline;
pub mod preprocess;
pub mod session;

pub use config::{ModelConfig, ModelRegistry, PreprocessorSpec, TaskModel, TaskModelRegistry};
pub use device::{select_best_device, DeviceMap};
pub use edit_types::{EditTypeRegistry, REPAINTING};
pub use error::{ConfigError, RequestError};
pub use invoke::{invoke, InvocationOutcome, SamplingParams};
pub use lifecycle::{ActivePipeline, PipelineManager};
pub use normalize::{normalize, EditPayload, NormalizedInputs};
pub use pipeline::{
    default_builder, InferenceKind, InputDefaults, InvocationRequest, Pipeline, PipelineBuilder,
    Sampler,
};
pub use preprocess::{Preprocessor, PreprocessorHub};
pub use session::{RenderOutput, RenderRequest, Studio};
