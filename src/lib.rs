// Subtitle API Library
//
// This crate provides an HTTP API that turns video and audio sources into subtitle
// documents: remote sources are fetched under a rate limit, audio is extracted with
// ffmpeg, transcribed with a Whisper engine, assembled into SRT or WebVTT cues, and
// optionally muxed back into the video as a soft subtitle track.

pub mod audio;
pub mod config;
pub mod config_loader;
pub mod embedder;
pub mod error;
pub mod fetcher;
pub mod file_utils;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod subtitles;
pub mod task;
pub mod transcriber;

// Re-export common types for easier access
pub use config::{MetricsConfig, PipelineConfig, ServerConfig};
pub use error::HandlerError;
pub use metrics::Metrics;
pub use models::{ErrorResponse, SuccessResponse, TaskCreatedResponse};
pub use orchestrator::Orchestrator;
pub use registry::TaskRegistry;
pub use task::{InputDescriptor, PipelineError, Stage, Task, TaskOptions, TaskStatus};
