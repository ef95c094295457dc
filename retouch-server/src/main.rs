use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use image::DynamicImage;
use retouch_core::{
    DeviceMap, EditPayload, InputDefaults, RenderRequest, RequestError, SamplingParams, Studio,
    REPAINTING,
};
use serde::{Deserialize, Serialize};
use std::{io::Cursor, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Retouch image editing server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Directory of model definition documents
    #[arg(long, default_value = "./config")]
    config_dir: String,

    /// Path to the task-model document
    #[arg(long, default_value = "./models/tasks.json")]
    task_models: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 2345)]
    port: u16,
}

fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

fn base64_to_image(data: &str) -> Result<DynamicImage, RequestError> {
    let bytes = BASE64_STANDARD
        .decode(data)
        .map_err(|e| RequestError::InvalidInput(format!("invalid base64 image: {e}")))?;
    image::load_from_memory(&bytes)
        .map_err(|e| RequestError::InvalidInput(format!("undecodable image: {e}")))
}

#[derive(Deserialize)]
struct EditPayloadBody {
    background: String,
    layers: Vec<String>,
}

#[derive(Deserialize)]
struct EditRequestBody {
    prompt: String,
    reference_image: Option<String>,
    edit: Option<EditPayloadBody>,
    task_type: String,
    #[serde(default = "default_edit_type")]
    edit_type: String,
    #[serde(default = "default_steps")]
    sample_steps: usize,
    #[serde(default = "default_guide_scale")]
    guide_scale: f64,
    #[serde(default = "default_seed")]
    seed: i64,
    #[serde(default = "default_dim")]
    output_height: usize,
    #[serde(default = "default_dim")]
    output_width: usize,
    #[serde(default = "default_repainting_scale")]
    repainting_scale: f32,
}

fn default_edit_type() -> String {
    REPAINTING.to_string()
}
fn default_steps() -> usize {
    20
}
fn default_guide_scale() -> f64 {
    4.5
}
fn default_seed() -> i64 {
    -1
}
fn default_dim() -> usize {
    1024
}
fn default_repainting_scale() -> f32 {
    1.0
}

#[derive(Serialize)]
struct EditResponse {
    image: String,
    preview_image: Option<String>,
    preview_mask: Option<String>,
    seed: u64,
    elapsed_seconds: f64,
    info: String,
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<String>,
    current: String,
}

#[derive(Deserialize)]
struct SelectModelBody {
    model: String,
}

#[derive(Serialize)]
struct SelectModelResponse {
    model: String,
    input: InputDefaults,
}

#[derive(Serialize)]
struct TasksResponse {
    tasks: Vec<String>,
    edit_types: Vec<String>,
}

#[derive(Deserialize)]
struct SelectTaskBody {
    task: String,
}

#[derive(Serialize)]
struct SelectTaskResponse {
    edit_types: Vec<String>,
    repainting_scales: Vec<f32>,
}

fn status_for(err: &RequestError) -> StatusCode {
    match err {
        RequestError::UnknownModel(_) | RequestError::UnknownTask(_) => StatusCode::NOT_FOUND,
        RequestError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        RequestError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &RequestError) -> axum::response::Response {
    tracing::warn!(error = %err, "request failed");
    (status_for(err), err.to_string()).into_response()
}

async fn edit_handler(
    State(studio): State<Arc<Studio>>,
    Json(body): Json<EditRequestBody>,
) -> impl IntoResponse {
    match run_edit(body, studio).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn run_edit(body: EditRequestBody, studio: Arc<Studio>) -> Result<EditResponse, RequestError> {
    let reference_image = body
        .reference_image
        .as_deref()
        .map(base64_to_image)
        .transpose()?;
    let edit_payload = body
        .edit
        .as_ref()
        .map(|edit| {
            Ok::<_, RequestError>(EditPayload {
                background: base64_to_image(&edit.background)?,
                layers: edit
                    .layers
                    .iter()
                    .map(|layer| base64_to_image(layer))
                    .collect::<Result<_, _>>()?,
            })
        })
        .transpose()?;

    let request = RenderRequest {
        prompt: body.prompt,
        reference_image,
        edit_payload,
        task_type: body.task_type,
        edit_type: body.edit_type,
        sampling: SamplingParams {
            sample_steps: body.sample_steps,
            guide_scale: body.guide_scale,
            seed: body.seed,
            output_height: body.output_height,
            output_width: body.output_width,
            repainting_scale: body.repainting_scale,
        },
    };

    // An invocation can run for minutes; keep it off the async workers.
    let output = tokio::task::spawn_blocking(move || studio.render(&request))
        .await
        .map_err(|e| RequestError::Inference(anyhow::anyhow!("render task failed: {e}")))??;

    let encode = |img: &DynamicImage| {
        image_to_base64_png(img)
            .map_err(|e| RequestError::Inference(anyhow::anyhow!("png encoding failed: {e}")))
    };
    let preview_image = output.preview_image.as_ref().map(encode).transpose()?;
    let preview_mask = output
        .preview_mask
        .as_ref()
        .map(|m| encode(&DynamicImage::ImageLuma8(m.clone())))
        .transpose()?;

    Ok(EditResponse {
        image: encode(&output.image)?,
        preview_image,
        preview_mask,
        seed: output.seed,
        elapsed_seconds: output.elapsed_seconds,
        info: output.info,
    })
}

async fn models_handler(State(studio): State<Arc<Studio>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: studio.model_names().to_vec(),
        current: studio.current_model(),
    })
}

async fn select_model_handler(
    State(studio): State<Arc<Studio>>,
    Json(body): Json<SelectModelBody>,
) -> impl IntoResponse {
    let studio_for_swap = studio.clone();
    let name = body.model.clone();
    // Constructing the replacement pipeline loads weights; keep that off the
    // async workers as well.
    let swapped = tokio::task::spawn_blocking(move || studio_for_swap.select_model(&name)).await;
    match swapped {
        Ok(Ok(input)) => Json(SelectModelResponse {
            model: body.model,
            input,
        })
        .into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => error_response(&RequestError::Inference(anyhow::anyhow!(
            "swap task failed: {e}"
        ))),
    }
}

async fn tasks_handler(State(studio): State<Arc<Studio>>) -> Json<TasksResponse> {
    Json(TasksResponse {
        tasks: studio.task_names().to_vec(),
        edit_types: studio.edit_type_names(),
    })
}

async fn select_task_handler(
    State(studio): State<Arc<Studio>>,
    Json(body): Json<SelectTaskBody>,
) -> impl IntoResponse {
    match studio.select_task(&body.task) {
        Ok(edit_types) => {
            let repainting_scales = edit_types
                .iter()
                .map(|edit_type| studio.repainting_scale_for(edit_type))
                .collect();
            Json(SelectTaskResponse {
                edit_types,
                repainting_scales,
            })
            .into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };

    // Configuration problems are fatal: never start serving half-loaded.
    let studio = Arc::new(Studio::open(
        &args.config_dir,
        &args.task_models,
        device_map,
    )?);

    let app = Router::new()
        .route("/v1/images/edits", post(edit_handler))
        .route("/v1/models", get(models_handler))
        .route("/v1/models/select", post(select_model_handler))
        .route("/v1/tasks", get(tasks_handler))
        .route("/v1/tasks/select", post(select_task_handler))
        .with_state(studio);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
