// API route handlers for the subtitle API
//
// Thin HTTP adapters over the orchestrator operations.

use actix_multipart::Multipart;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{delete, get, post, web, HttpResponse};
use log::{info, warn};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::error::HandlerError;
use crate::handlers::form::extract_upload;
use crate::metrics::Metrics;
use crate::models::{
    HealthResponse, RemoteTaskRequest, SuccessResponse, SupportedFormatsResponse,
    TaskCreatedResponse, TaskListResponse,
};
use crate::orchestrator::Orchestrator;
use crate::process::tool_version;
use crate::task::{ArtifactKind, InputDescriptor, TaskLookupError, TaskOptions};

/// Upper bound on the ffmpeg availability check
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

async fn record(metrics: &Metrics, endpoint: &str, method: &str, status: &str, start: Instant) {
    metrics
        .record_http_request(endpoint, method, status, start.elapsed().as_secs_f64())
        .await;
}

/// Content type served for an artifact, from its extension
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "srt" => "application/x-subrip",
        "vtt" => "text/vtt; charset=utf-8",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        _ => "application/octet-stream",
    }
}

async fn artifact_response(path: &Path) -> Result<HttpResponse, HandlerError> {
    let body = tokio::fs::read(path).await?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(HttpResponse::Ok()
        .content_type(content_type_for(path))
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(filename)],
        })
        .body(body))
}

/// Handler for upload tasks
///
/// Receives a media file and task options as multipart form data, saves the file in
/// a fresh task directory and queues the task.
#[post("/tasks")]
pub async fn create_task(
    form: Multipart,
    orchestrator: web::Data<Orchestrator>,
    config: web::Data<ServerConfig>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, HandlerError> {
    let start_time = Instant::now();
    let (params, paths, upload_size) = extract_upload(form, &orchestrator, &config).await?;
    let media_file = params.media_file.ok_or(HandlerError::NoMediaFile)?;
    metrics.record_upload_size(upload_size).await;

    let task_id = orchestrator
        .submit(
            paths,
            InputDescriptor::UploadedFile { path: media_file },
            params.options,
        )
        .await?;
    info!("Task {} accepted for upload", task_id);

    record(&metrics, "/tasks", "POST", "202", start_time).await;
    Ok(HttpResponse::Accepted().json(TaskCreatedResponse::new(task_id)))
}

/// Handler for remote reference tasks
#[post("/tasks/remote")]
pub async fn create_remote_task(
    request: web::Json<RemoteTaskRequest>,
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, HandlerError> {
    let start_time = Instant::now();
    let request = request.into_inner();
    let subtitle_format = request
        .subtitle_format()
        .map_err(HandlerError::InvalidSubtitleFormat)?;

    let options = TaskOptions {
        language: request.language,
        embed_subtitles: request.embed_subtitles,
        subtitle_format,
        translate: request.translate,
    };
    let input = InputDescriptor::RemoteReference {
        url: request.url,
        desired_resolution: request.resolution,
        audio_only: request.audio_only,
    };

    let task_id = orchestrator.create_task(input, options).await?;
    info!("Task {} accepted for remote source", task_id);

    record(&metrics, "/tasks/remote", "POST", "202", start_time).await;
    Ok(HttpResponse::Accepted().json(TaskCreatedResponse::new(task_id)))
}

#[get("/tasks")]
pub async fn list_tasks(
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, HandlerError> {
    let start_time = Instant::now();
    let tasks = orchestrator.list_tasks().await;

    record(&metrics, "/tasks", "GET", "200", start_time).await;
    Ok(HttpResponse::Ok().json(TaskListResponse { tasks }))
}

/// Handler for task status requests
#[get("/tasks/{task_id}")]
pub async fn task_status(
    task_id: web::Path<String>,
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, HandlerError> {
    let start_time = Instant::now();
    let status = orchestrator.get_status(&task_id).await?;

    record(&metrics, "/tasks/{task_id}", "GET", "200", start_time).await;
    Ok(HttpResponse::Ok().json(status))
}

/// Download the subtitle document of a completed task
#[get("/tasks/{task_id}/subtitle")]
pub async fn task_subtitle(
    task_id: web::Path<String>,
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, HandlerError> {
    let start_time = Instant::now();
    let path = orchestrator
        .get_artifact(&task_id, ArtifactKind::Subtitle)
        .await?;
    let response = artifact_response(&path).await?;

    record(&metrics, "/tasks/{task_id}/subtitle", "GET", "200", start_time).await;
    Ok(response)
}

/// Download the video with embedded subtitles of a completed task
#[get("/tasks/{task_id}/video")]
pub async fn task_video(
    task_id: web::Path<String>,
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, HandlerError> {
    let start_time = Instant::now();
    let path = orchestrator.get_artifact(&task_id, ArtifactKind::Video).await?;
    let response = artifact_response(&path).await?;

    record(&metrics, "/tasks/{task_id}/video", "GET", "200", start_time).await;
    Ok(response)
}

/// Cancel a running task, or forget a finished one and delete its files
#[delete("/tasks/{task_id}")]
pub async fn delete_task(
    task_id: web::Path<String>,
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, HandlerError> {
    let start_time = Instant::now();
    let task_id = task_id.into_inner();

    let message = match orchestrator.cancel_task(&task_id).await {
        Ok(()) => "Cancellation requested",
        Err(TaskLookupError::AlreadyTerminal(_)) => {
            orchestrator.reap_task(&task_id).await?;
            "Task removed"
        }
        Err(e) => {
            warn!("Failed to delete task {}: {}", task_id, e);
            return Err(e.into());
        }
    };
    info!("DELETE task {}: {}", task_id, message);

    record(&metrics, "/tasks/{task_id}", "DELETE", "200", start_time).await;
    Ok(HttpResponse::Ok().json(SuccessResponse {
        success: true,
        message: message.to_string(),
    }))
}

/// Service health: reports degraded when ffmpeg cannot be run
#[get("/health")]
pub async fn health(
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> HttpResponse {
    let start_time = Instant::now();
    let ffmpeg_cmd = &orchestrator.config().ffmpeg_cmd;
    let version = match tool_version(ffmpeg_cmd, HEALTH_CHECK_TIMEOUT).await {
        Ok(version) => Some(version),
        Err(e) => {
            warn!("Health check: {}", e);
            None
        }
    };

    record(&metrics, "/health", "GET", "200", start_time).await;
    HttpResponse::Ok().json(HealthResponse::new(version, orchestrator.active_tasks()))
}

/// Upload extensions accepted by `POST /tasks`
#[get("/supported-formats")]
pub async fn supported_formats(metrics: web::Data<Metrics>) -> HttpResponse {
    let start_time = Instant::now();
    let response = SupportedFormatsResponse::new(ServerConfig::allowed_extensions());

    record(&metrics, "/supported-formats", "GET", "200", start_time).await;
    HttpResponse::Ok().json(response)
}

/// Metrics endpoint handler
#[get("/metrics")]
pub async fn metrics_handler(metrics: web::Data<Metrics>) -> Result<HttpResponse, HandlerError> {
    let data = metrics.export().await?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(data))
}
