// Subtitle API configuration
//
// This module contains configuration structures and constants for the subtitle service.
// Every value has a default and can be overridden through the environment
// (or through subtitle_api.conf, see config_loader).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::transcriber::WhisperConfig;

/// Default values for configuration
pub mod defaults {
    pub const HOST: &str = "127.0.0.1";
    pub const PORT: u16 = 8282;

    // Client disconnect timeout and keep-alive, in seconds
    pub const CLIENT_TIMEOUT_SECONDS: u64 = 480;
    pub const KEEP_ALIVE_SECONDS: u64 = 480;

    // Root under which every task gets its own working directory
    pub const WORK_DIR: &str = "/tmp/subtitle_api";

    // 2 GiB
    pub const MAX_FILE_SIZE: usize = 2 * 1024 * 1024 * 1024;

    pub const FFMPEG_CMD: &str = "ffmpeg";
    pub const YTDLP_CMD: &str = "yt-dlp";

    // Remote fetch budget and retry policy
    pub const FETCH_RATE_LIMIT_BYTES: u64 = 1024 * 1024;
    pub const FETCH_MAX_ATTEMPTS: u32 = 3;
    pub const FETCH_RETRY_BASE_MS: u64 = 2000;
    pub const FETCH_RETRY_MAX_MS: u64 = 60_000;

    // Per-stage timeouts in seconds
    pub const FETCH_TIMEOUT_SECONDS: u64 = 1800;
    pub const EXTRACT_TIMEOUT_SECONDS: u64 = 600;
    pub const EMBED_TIMEOUT_SECONDS: u64 = 900;

    pub const MIN_CUE_DURATION_MS: u64 = 1000;
    pub const AUDIO_SAMPLE_RATE: u32 = 16_000;

    pub const TASK_RETENTION_HOURS: u64 = 48;
    pub const CLEANUP_INTERVAL_HOURS: u64 = 1;

    // Upload containers accepted by POST /tasks
    pub const ALLOWED_EXTENSIONS: [&str; 10] = [
        "mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4a", "mp3", "wav",
    ];
    // Accepted uploads without a video stream
    pub const AUDIO_EXTENSIONS: [&str; 3] = ["m4a", "mp3", "wav"];

    pub const LANGUAGE: &str = "en";
    pub const RESOLUTION: u32 = 720;
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn hours(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(3600))
}

/// Worker pool default: half the logical cores, at least one
pub fn default_worker_count() -> usize {
    (num_cpus::get() / 2).max(1)
}

/// Configuration errors detected at startup
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("FETCH_RETRY_BASE_MS ({base}) exceeds FETCH_RETRY_MAX_MS ({max})")]
    BackoffRange { base: u64, max: u64 },
}

/// HTTP surface configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum accepted upload size in bytes
    pub max_file_size: usize,
    pub client_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: env::var("SUBTITLE_API_HOST").unwrap_or_else(|_| String::from(defaults::HOST)),
            port: env_or("SUBTITLE_API_PORT", defaults::PORT),
            max_file_size: env_or("MAX_FILE_SIZE", defaults::MAX_FILE_SIZE),
            client_timeout: Duration::from_secs(env_or(
                "SUBTITLE_API_TIMEOUT",
                defaults::CLIENT_TIMEOUT_SECONDS,
            )),
            keep_alive: Duration::from_secs(env_or(
                "SUBTITLE_API_KEEPALIVE",
                defaults::KEEP_ALIVE_SECONDS,
            )),
        }
    }
}

impl ServerConfig {
    pub fn is_allowed_extension(extension: &str) -> bool {
        let extension = extension.to_lowercase();
        defaults::ALLOWED_EXTENSIONS.contains(&extension.as_str())
    }

    /// Accepted extensions, in the order they are advertised
    pub fn allowed_extensions() -> &'static [&'static str] {
        &defaults::ALLOWED_EXTENSIONS
    }

    pub fn is_audio_extension(extension: &str) -> bool {
        let extension = extension.to_lowercase();
        defaults::AUDIO_EXTENSIONS.contains(&extension.as_str())
    }
}

/// Pipeline configuration shared by the orchestrator and its stages
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub work_dir: PathBuf,
    pub ffmpeg_cmd: String,
    pub ytdlp_cmd: String,
    pub whisper: WhisperConfig,
    /// Sustained remote fetch budget, bytes per second
    pub fetch_rate_limit_bytes: u64,
    pub fetch_max_attempts: u32,
    pub fetch_retry_base: Duration,
    pub fetch_retry_max: Duration,
    pub fetch_timeout: Duration,
    pub extract_timeout: Duration,
    pub embed_timeout: Duration,
    /// Worker pool size: tasks running stages at the same time
    pub max_concurrent_tasks: usize,
    pub min_cue_duration_ms: u64,
    pub audio_sample_rate: u32,
    pub task_retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(
                env::var("SUBTITLE_WORK_DIR").unwrap_or_else(|_| String::from(defaults::WORK_DIR)),
            ),
            ffmpeg_cmd: env::var("FFMPEG_CMD").unwrap_or_else(|_| String::from(defaults::FFMPEG_CMD)),
            ytdlp_cmd: env::var("YTDLP_CMD").unwrap_or_else(|_| String::from(defaults::YTDLP_CMD)),
            whisper: WhisperConfig::default(),
            fetch_rate_limit_bytes: env_or("FETCH_RATE_LIMIT_BYTES", defaults::FETCH_RATE_LIMIT_BYTES),
            fetch_max_attempts: env_or("FETCH_MAX_ATTEMPTS", defaults::FETCH_MAX_ATTEMPTS),
            fetch_retry_base: Duration::from_millis(env_or(
                "FETCH_RETRY_BASE_MS",
                defaults::FETCH_RETRY_BASE_MS,
            )),
            fetch_retry_max: Duration::from_millis(env_or(
                "FETCH_RETRY_MAX_MS",
                defaults::FETCH_RETRY_MAX_MS,
            )),
            fetch_timeout: Duration::from_secs(env_or(
                "FETCH_TIMEOUT_SECONDS",
                defaults::FETCH_TIMEOUT_SECONDS,
            )),
            extract_timeout: Duration::from_secs(env_or(
                "EXTRACT_TIMEOUT_SECONDS",
                defaults::EXTRACT_TIMEOUT_SECONDS,
            )),
            embed_timeout: Duration::from_secs(env_or(
                "EMBED_TIMEOUT_SECONDS",
                defaults::EMBED_TIMEOUT_SECONDS,
            )),
            max_concurrent_tasks: env_or("MAX_CONCURRENT_TASKS", default_worker_count()),
            min_cue_duration_ms: env_or("MIN_CUE_DURATION_MS", defaults::MIN_CUE_DURATION_MS),
            audio_sample_rate: env_or("AUDIO_SAMPLE_RATE", defaults::AUDIO_SAMPLE_RATE),
            task_retention: hours(env_or("TASK_RETENTION_HOURS", defaults::TASK_RETENTION_HOURS)),
            cleanup_interval: hours(env_or(
                "CLEANUP_INTERVAL_HOURS",
                defaults::CLEANUP_INTERVAL_HOURS,
            )),
        }
    }
}

impl PipelineConfig {
    /// Reject values that would stall or misconfigure the pipeline
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_rate_limit_bytes == 0 {
            return Err(ConfigError::Zero("FETCH_RATE_LIMIT_BYTES"));
        }
        if self.fetch_max_attempts == 0 {
            return Err(ConfigError::Zero("FETCH_MAX_ATTEMPTS"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Zero("MAX_CONCURRENT_TASKS"));
        }
        if self.audio_sample_rate == 0 {
            return Err(ConfigError::Zero("AUDIO_SAMPLE_RATE"));
        }
        let timeouts = [
            ("FETCH_TIMEOUT_SECONDS", self.fetch_timeout),
            ("EXTRACT_TIMEOUT_SECONDS", self.extract_timeout),
            ("TRANSCRIBE_TIMEOUT_SECONDS", self.whisper.timeout),
            ("EMBED_TIMEOUT_SECONDS", self.embed_timeout),
            ("CLEANUP_INTERVAL_HOURS", self.cleanup_interval),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(ConfigError::Zero(name));
        }
        if self.fetch_retry_base > self.fetch_retry_max {
            return Err(ConfigError::BackoffRange {
                base: self.fetch_retry_base.as_millis() as u64,
                max: self.fetch_retry_max.as_millis() as u64,
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.fetch_max_attempts, self.fetch_retry_base, self.fetch_retry_max)
    }
}

/// Configuration for metrics collection and export
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Type of metrics exporter ("prometheus", "none")
    pub exporter_type: String,
    /// Prefix for exported metric names
    pub namespace: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        let metrics_enabled = env_or("SUBTITLE_API_METRICS_ENABLED", true);
        let exporter_type = if !metrics_enabled {
            "disabled".to_string()
        } else {
            env::var("METRICS_BACKEND").unwrap_or_else(|_| "none".to_string())
        };
        Self {
            exporter_type,
            namespace: env::var("METRICS_NAMESPACE").ok().filter(|ns| !ns.is_empty()),
        }
    }
}

/// Identity and working directory reserved for a task
#[derive(Debug, Clone)]
pub struct TaskPaths {
    /// Task ID (UUID)
    pub id: String,
    /// Working directory holding every file the task produces
    pub folder: PathBuf,
}
