use thiserror::Error;

/// Fatal configuration problems detected at load time.
///
/// The process must not start serving with a broken registry, so these are
/// never recovered from.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no model documents found in {0}")]
    EmptyModelDir(String),

    #[error("duplicate model name {0:?} declared by more than one document")]
    DuplicateModelName(String),

    #[error("task {task:?}: {reason}")]
    InvalidTaskModel { task: String, reason: String },
}

/// Per-request failures. These are isolated to the request that raised them;
/// the serving loop and the active pipeline state stay intact.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("unknown model {0:?}")]
    UnknownModel(String),

    #[error("unknown task type {0:?}")]
    UnknownTask(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A failure raised by the pipeline call itself, propagated unchanged.
    #[error("inference failed: {0}")]
    Inference(#[source] anyhow::Error),
}
