// Subtitle API data models
//
// Request and response bodies used by the HTTP handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::defaults;
use crate::task::{SubtitleFormat, TaskOptions, TaskStatus};

/// Response for an accepted task
#[derive(Serialize)]
pub struct TaskCreatedResponse {
    /// Task ID assigned to the request
    pub task_id: String,
    /// URL to poll for the task status
    pub status_url: String,
}

impl TaskCreatedResponse {
    pub fn new(task_id: String) -> Self {
        let status_url = format!("/tasks/{}", task_id);
        Self { task_id, status_url }
    }
}

/// Parameters collected from a multipart upload
#[derive(Debug, Default)]
pub struct UploadParams {
    pub options: TaskOptions,
    /// Path of the saved upload inside the task directory
    pub media_file: Option<PathBuf>,
}

fn default_language() -> String {
    String::from(defaults::LANGUAGE)
}

fn default_resolution() -> u32 {
    defaults::RESOLUTION
}

/// JSON body of `POST /tasks/remote`
#[derive(Debug, Deserialize)]
pub struct RemoteTaskRequest {
    pub url: String,
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    #[serde(default)]
    pub audio_only: bool,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub embed_subtitles: bool,
    /// "srt" or "vtt"
    #[serde(default)]
    pub subtitle_format: Option<String>,
    #[serde(default)]
    pub translate: bool,
}

/// Error response for API
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Optional status information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Success response for API
#[derive(Serialize)]
pub struct SuccessResponse {
    /// Success flag
    pub success: bool,
    /// Message describing the successful operation
    pub message: String,
}

#[derive(Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskStatus>,
}

/// Body of `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy" or "degraded"
    pub status: &'static str,
    pub ffmpeg_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_version: Option<String>,
    pub active_tasks: usize,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl HealthResponse {
    pub fn new(ffmpeg_version: Option<String>, active_tasks: usize) -> Self {
        let ffmpeg_available = ffmpeg_version.is_some();
        let (status, message) = if ffmpeg_available {
            ("healthy", "All systems operational".to_string())
        } else {
            (
                "degraded",
                "ffmpeg not found: audio extraction and embedding will fail".to_string(),
            )
        };
        Self {
            status,
            ffmpeg_available,
            ffmpeg_version,
            active_tasks,
            timestamp: Utc::now(),
            message,
        }
    }
}

/// Body of `GET /supported-formats`
#[derive(Debug, Serialize)]
pub struct SupportedFormatsResponse {
    /// Upload extensions with their leading dot, e.g. ".mp4"
    pub supported_formats: Vec<String>,
}

impl SupportedFormatsResponse {
    pub fn new(extensions: &[&str]) -> Self {
        Self {
            supported_formats: extensions.iter().map(|e| format!(".{}", e)).collect(),
        }
    }
}

impl RemoteTaskRequest {
    /// Subtitle format requested, if it names a known one
    pub fn subtitle_format(&self) -> Result<SubtitleFormat, String> {
        match &self.subtitle_format {
            None => Ok(SubtitleFormat::default()),
            Some(value) => SubtitleFormat::parse(value).ok_or_else(|| value.clone()),
        }
    }
}
