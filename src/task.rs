//! Task model for the subtitle pipeline
//!
//! A task is the unit of work tracked by the registry: the input it was created from,
//! the options requested for it, the stage it has reached, and either its result
//! artifacts (once completed) or its error record (once failed).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Where the media for a task comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputDescriptor {
    /// A file already on local disk, owned by the caller
    UploadedFile { path: PathBuf },
    /// A remote video reference resolved and fetched by the pipeline
    RemoteReference {
        url: String,
        /// Maximum vertical resolution (e.g. 720, 1080)
        desired_resolution: u32,
        audio_only: bool,
    },
}

impl InputDescriptor {
    pub fn is_remote(&self) -> bool {
        matches!(self, InputDescriptor::RemoteReference { .. })
    }

    /// Short label used in logs and metric labels
    pub fn label(&self) -> &'static str {
        match self {
            InputDescriptor::UploadedFile { .. } => "upload",
            InputDescriptor::RemoteReference { .. } => "remote",
        }
    }
}

/// On-disk format of the subtitle document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SubtitleFormat {
    #[default]
    #[serde(rename = "srt")]
    Srt,
    #[serde(rename = "vtt")]
    WebVtt,
}

impl SubtitleFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SubtitleFormat::Srt => "srt",
            SubtitleFormat::WebVtt => "vtt",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "srt" => Some(SubtitleFormat::Srt),
            "vtt" | "webvtt" => Some(SubtitleFormat::WebVtt),
            _ => None,
        }
    }
}

/// Options requested when the task was created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskOptions {
    /// Language tag passed to the ASR engine and written on the subtitle track
    pub language: String,
    /// Mux the subtitle document back into the source video
    pub embed_subtitles: bool,
    #[serde(default)]
    pub subtitle_format: SubtitleFormat,
    /// Ask the ASR engine to translate speech to English
    #[serde(default)]
    pub translate: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            language: String::from("en"),
            embed_subtitles: false,
            subtitle_format: SubtitleFormat::default(),
            translate: false,
        }
    }
}

/// Stages of the task state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    FetchingSource,
    ExtractingAudio,
    Transcribing,
    AssemblingSubtitles,
    EmbeddingSubtitles,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::FetchingSource => "fetching_source",
            Stage::ExtractingAudio => "extracting_audio",
            Stage::Transcribing => "transcribing",
            Stage::AssemblingSubtitles => "assembling_subtitles",
            Stage::EmbeddingSubtitles => "embedding_subtitles",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    fn ordinal(&self) -> u8 {
        match self {
            Stage::Queued => 0,
            Stage::FetchingSource => 1,
            Stage::ExtractingAudio => 2,
            Stage::Transcribing => 3,
            Stage::AssemblingSubtitles => 4,
            Stage::EmbeddingSubtitles => 5,
            Stage::Completed => 6,
            Stage::Failed => 7,
        }
    }

    /// Transitions are strictly forward; any non-terminal stage may fail.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Stage::Failed || next.ordinal() > self.ordinal()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error classification surfaced to clients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientNetworkError,
    SourceUnavailable,
    UnsupportedSource,
    UnprocessableMedia,
    TranscriptionFailed,
    EmbeddingFailed,
    Cancelled,
    RetriesExhausted,
    InternalTimeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetworkError => "TransientNetworkError",
            ErrorKind::SourceUnavailable => "SourceUnavailable",
            ErrorKind::UnsupportedSource => "UnsupportedSource",
            ErrorKind::UnprocessableMedia => "UnprocessableMedia",
            ErrorKind::TranscriptionFailed => "TranscriptionFailed",
            ErrorKind::EmbeddingFailed => "EmbeddingFailed",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::RetriesExhausted => "RetriesExhausted",
            ErrorKind::InternalTimeout => "InternalTimeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by pipeline stages
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network timeout, connection reset or remote throttling; retried by the fetcher
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The remote source denied access or does not exist
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The source reference is malformed or not supported
    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    /// The media has no usable audio or the transcoding tool rejected it
    #[error("Unprocessable media: {message}\n{stderr_tail}")]
    UnprocessableMedia { message: String, stderr_tail: String },

    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<PipelineError>,
    },

    #[error("Stage {stage} timed out after {} seconds", .timeout.as_secs())]
    InternalTimeout { stage: Stage, timeout: Duration },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::TransientNetwork(_) => ErrorKind::TransientNetworkError,
            PipelineError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            PipelineError::UnsupportedSource(_) => ErrorKind::UnsupportedSource,
            PipelineError::UnprocessableMedia { .. } => ErrorKind::UnprocessableMedia,
            PipelineError::TranscriptionFailed(_) => ErrorKind::TranscriptionFailed,
            PipelineError::EmbeddingFailed(_) => ErrorKind::EmbeddingFailed,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            PipelineError::InternalTimeout { .. } => ErrorKind::InternalTimeout,
        }
    }

    /// Only network-level failures are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientNetwork(_))
    }
}

/// Error record stored on a failed task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for TaskError {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Files a completed task exposes to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskArtifacts {
    pub subtitle_path: PathBuf,
    pub video_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Subtitle,
    Video,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTransition {
    pub stage: Stage,
    pub entered_at: DateTime<Utc>,
}

/// The unit-of-work record
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub input: InputDescriptor,
    pub options: TaskOptions,
    /// Per-task working directory holding every file the pipeline writes
    pub work_dir: PathBuf,
    pub stage: Stage,
    pub artifacts: Option<TaskArtifacts>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub stage_entered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub history: Vec<StageTransition>,
}

impl Task {
    pub fn new(id: String, input: InputDescriptor, options: TaskOptions, work_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            input,
            options,
            work_dir,
            stage: Stage::Queued,
            artifacts: None,
            error: None,
            created_at: now,
            stage_entered_at: now,
            completed_at: None,
            history: vec![StageTransition {
                stage: Stage::Queued,
                entered_at: now,
            }],
        }
    }

    /// Move to `stage`. Returns false and leaves the task untouched if the
    /// transition would go backwards or leave a terminal stage.
    pub(crate) fn enter_stage(&mut self, stage: Stage) -> bool {
        if !self.stage.can_advance_to(stage) {
            return false;
        }
        let now = Utc::now();
        self.stage = stage;
        self.stage_entered_at = now;
        self.history.push(StageTransition {
            stage,
            entered_at: now,
        });
        if stage.is_terminal() {
            self.completed_at = Some(now);
        }
        true
    }

    pub(crate) fn complete(&mut self, artifacts: TaskArtifacts) -> bool {
        if !self.enter_stage(Stage::Completed) {
            return false;
        }
        self.artifacts = Some(artifacts);
        true
    }

    pub(crate) fn fail(&mut self, error: TaskError) -> bool {
        if !self.enter_stage(Stage::Failed) {
            return false;
        }
        self.error = Some(error);
        true
    }

    pub fn passed_through(&self, stage: Stage) -> bool {
        self.history.iter().any(|t| t.stage == stage)
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            id: self.id.clone(),
            stage: self.stage,
            error: self.error.clone(),
            input_kind: self.input.label(),
            embed_subtitles: self.options.embed_subtitles,
            created_at: self.created_at,
            stage_entered_at: self.stage_entered_at,
            completed_at: self.completed_at,
        }
    }
}

/// Snapshot returned by status queries
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub input_kind: &'static str,
    pub embed_subtitles: bool,
    pub created_at: DateTime<Utc>,
    pub stage_entered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Errors returned by task lookups
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TaskLookupError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {0} is not completed yet")]
    NotReady(String),

    #[error("Task {0} has no {1:?} artifact")]
    NoSuchArtifact(String, ArtifactKind),

    #[error("Task {0} has already finished")]
    AlreadyTerminal(String),

    #[error("Task {0} is still running")]
    StillRunning(String),
}

/// Errors returned when a task request is rejected before it is queued
#[derive(Error, Debug)]
pub enum TaskRequestError {
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
