//! Remote source fetching
//!
//! A resolver (yt-dlp) lists the stream variants a remote reference offers; the pipeline
//! picks either one combined stream or a video-only plus audio-only pair, and transfers
//! the bytes itself so every chunk passes through the shared [`RateLimiter`]. A pair is
//! muxed with an ffmpeg stream copy once both halves are on disk. The whole
//! resolve-select-transfer sequence runs under the [`RetryPolicy`], writing to fresh
//! partial files on each attempt.

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use url::Url;

use crate::metrics::Metrics;
use crate::process::{run_command, ProcessError};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::task::{PipelineError, Stage};

/// Stem of the fetched source inside a task directory
pub const SOURCE_STEM: &str = "source";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Materialize `url` as a local file inside `output_dir`
    async fn fetch(
        &self,
        url: &str,
        desired_resolution: u32,
        audio_only: bool,
        output_dir: &Path,
    ) -> Result<PathBuf, PipelineError>;
}

/// One downloadable stream offered by a remote source
#[derive(Debug, Clone, PartialEq)]
pub struct StreamVariant {
    pub format_id: String,
    pub url: String,
    pub ext: String,
    pub height: Option<u32>,
    /// Total bitrate in kbit/s
    pub bitrate: Option<f64>,
    pub has_video: bool,
    pub has_audio: bool,
    pub http_headers: HashMap<String, String>,
}

impl StreamVariant {
    fn is_progressive(&self) -> bool {
        self.has_video && self.has_audio
    }

    fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }

    fn is_video_only(&self) -> bool {
        self.has_video && !self.has_audio
    }

    fn bitrate_or_zero(&self) -> f64 {
        self.bitrate.unwrap_or(0.0)
    }
}

/// Lists the stream variants of a remote reference
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<Vec<StreamVariant>, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct FormatEntry {
    #[serde(default)]
    format_id: String,
    url: Option<String>,
    ext: Option<String>,
    height: Option<u32>,
    tbr: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    protocol: Option<String>,
    #[serde(default)]
    http_headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ResolvedMedia {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    formats: Vec<FormatEntry>,
    // Single-stream extractors report the stream at the top level
    #[serde(flatten)]
    top_level: FormatEntry,
}

fn codec_present(codec: &Option<String>) -> bool {
    codec.as_deref() != Some("none")
}

impl FormatEntry {
    fn into_variant(self) -> Option<StreamVariant> {
        let url = self.url?;
        let direct = match self.protocol.as_deref() {
            None => url.starts_with("http://") || url.starts_with("https://"),
            Some(p) => p == "http" || p == "https",
        };
        if !direct {
            return None;
        }
        Some(StreamVariant {
            has_video: codec_present(&self.vcodec),
            has_audio: codec_present(&self.acodec),
            format_id: self.format_id,
            url,
            ext: self.ext.unwrap_or_else(|| "mp4".to_string()),
            height: self.height,
            bitrate: self.tbr,
            http_headers: self.http_headers,
        })
    }
}

/// Parse resolver JSON into directly downloadable variants
pub fn parse_variants(json: &str) -> Result<Vec<StreamVariant>, PipelineError> {
    let media: ResolvedMedia = serde_json::from_str(json).map_err(|e| {
        PipelineError::UnsupportedSource(format!("Unreadable stream listing: {}", e))
    })?;
    if let Some(title) = &media.title {
        debug!("Resolved remote source: {}", title);
    }

    let mut variants: Vec<StreamVariant> = media
        .formats
        .into_iter()
        .filter_map(FormatEntry::into_variant)
        .collect();
    if variants.is_empty() {
        variants.extend(media.top_level.into_variant());
    }
    Ok(variants)
}

/// What an attempt downloads for a remote reference
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSelection {
    /// One stream carrying everything the task needs
    Single(StreamVariant),
    /// Separate video and audio streams, muxed after download
    Merged {
        video: StreamVariant,
        audio: StreamVariant,
    },
}

impl StreamSelection {
    /// Container extension of the fetched source
    pub fn extension(&self) -> &str {
        match self {
            StreamSelection::Single(variant) => variant.ext.as_str(),
            StreamSelection::Merged { video, audio } => merged_extension(&video.ext, &audio.ext),
        }
    }
}

/// Container that takes both streams without re-encoding
fn merged_extension(video_ext: &str, audio_ext: &str) -> &'static str {
    match (video_ext, audio_ext) {
        ("mp4", "m4a") | ("mp4", "mp4") => "mp4",
        ("webm", "webm") => "webm",
        _ => "mkv",
    }
}

/// Ordering between two candidates of the same height, preferred first
fn same_height(a: &StreamVariant, b: &StreamVariant) -> Ordering {
    a.is_video_only()
        .cmp(&b.is_video_only())
        .then(a.bitrate_or_zero().total_cmp(&b.bitrate_or_zero()))
}

fn best_audio(variants: &[StreamVariant]) -> Option<&StreamVariant> {
    variants
        .iter()
        .filter(|v| v.is_audio_only())
        .max_by(|a, b| a.bitrate_or_zero().total_cmp(&b.bitrate_or_zero()))
}

/// Pick what to download.
///
/// Video: the highest resolution not above `desired_resolution`; if nothing fits, the
/// smallest resolution above it. Candidates are combined streams and, when an audio-only
/// stream exists, video-only streams paired with the best audio. At equal resolution a
/// combined stream wins, then the lower bitrate. Audio-only requests take the best
/// audio-only stream when one is offered, otherwise fall back to video.
pub fn select_streams(
    variants: &[StreamVariant],
    desired_resolution: u32,
    audio_only: bool,
) -> Option<StreamSelection> {
    let audio = best_audio(variants);
    if audio_only {
        if let Some(audio) = audio {
            return Some(StreamSelection::Single(audio.clone()));
        }
    }

    let candidates: Vec<&StreamVariant> = variants
        .iter()
        .filter(|v| v.is_progressive() || (audio.is_some() && v.is_video_only()))
        .collect();
    let within = candidates
        .iter()
        .filter(|v| v.height.unwrap_or(0) <= desired_resolution)
        .min_by(|a, b| {
            b.height
                .unwrap_or(0)
                .cmp(&a.height.unwrap_or(0))
                .then_with(|| same_height(a, b))
        });
    let chosen = match within {
        Some(variant) => *variant,
        None => *candidates.iter().min_by(|a, b| {
            a.height
                .unwrap_or(0)
                .cmp(&b.height.unwrap_or(0))
                .then_with(|| same_height(a, b))
        })?,
    };

    if chosen.is_progressive() {
        return Some(StreamSelection::Single(chosen.clone()));
    }
    audio.map(|audio| StreamSelection::Merged {
        video: chosen.clone(),
        audio: audio.clone(),
    })
}

/// Reject references that can never be fetched
pub fn validate_reference(reference: &str) -> Result<Url, PipelineError> {
    let url = Url::parse(reference.trim())
        .map_err(|e| PipelineError::UnsupportedSource(format!("{}: {}", reference, e)))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(PipelineError::UnsupportedSource(format!(
            "Unsupported reference: {}",
            reference
        ))),
    }
}

/// Map resolver diagnostics onto the error taxonomy
pub fn classify_resolver_error(stderr: &str) -> PipelineError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();

    if lower.contains("unsupported url") || lower.contains("is not a valid url") {
        return PipelineError::UnsupportedSource(message);
    }

    const UNAVAILABLE: [&str; 8] = [
        "http error 401",
        "http error 403",
        "http error 404",
        "http error 410",
        "video unavailable",
        "private video",
        "this video is not available",
        "members-only",
    ];
    if UNAVAILABLE.iter().any(|needle| lower.contains(needle)) {
        return PipelineError::SourceUnavailable(message);
    }

    PipelineError::TransientNetwork(message)
}

/// Map a non-success HTTP status onto the error taxonomy
pub fn classify_status(status: StatusCode) -> PipelineError {
    let message = format!("Remote responded with {}", status);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        PipelineError::TransientNetwork(message)
    } else {
        PipelineError::SourceUnavailable(message)
    }
}

/// Resolver backed by the yt-dlp command
pub struct YtDlpResolver {
    command_path: String,
    timeout: Duration,
}

impl YtDlpResolver {
    pub fn new(command_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command_path: command_path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl StreamResolver for YtDlpResolver {
    async fn resolve(&self, url: &str) -> Result<Vec<StreamVariant>, PipelineError> {
        let mut command = Command::new(&self.command_path);
        command
            .arg("--dump-single-json")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--skip-download")
            .arg(url);

        let output = run_command(command, self.timeout)
            .await
            .map_err(|e| match e {
                ProcessError::Failed { stderr_tail, .. } => classify_resolver_error(&stderr_tail),
                ProcessError::TimedOut { .. } => {
                    PipelineError::TransientNetwork(format!("Resolving {} timed out", url))
                }
                spawn @ ProcessError::Spawn { .. } => {
                    PipelineError::SourceUnavailable(spawn.to_string())
                }
            })?;

        parse_variants(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Muxes a downloaded video-only stream with its audio-only companion
#[async_trait]
pub trait StreamMerger: Send + Sync {
    async fn merge(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), PipelineError>;
}

/// Merger backed by an ffmpeg stream copy
pub struct FfmpegStreamMerger {
    ffmpeg_path: String,
    timeout: Duration,
}

impl FfmpegStreamMerger {
    pub fn new(ffmpeg_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout,
        }
    }

    fn build_command(&self, video: &Path, audio: &Path, output: &Path) -> Command {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .arg("-nostdin")
            .arg("-hide_banner")
            .arg("-y")
            .arg("-i")
            .arg(video)
            .arg("-i")
            .arg(audio)
            .arg("-map")
            .arg("0:v:0")
            .arg("-map")
            .arg("1:a:0")
            .arg("-c")
            .arg("copy")
            .arg(output);
        command
    }
}

#[async_trait]
impl StreamMerger for FfmpegStreamMerger {
    async fn merge(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), PipelineError> {
        run_command(self.build_command(video, audio, output), self.timeout)
            .await
            .map(|_| ())
            .map_err(|e| classify_merge_error(e, self.timeout))
    }
}

fn classify_merge_error(err: ProcessError, timeout: Duration) -> PipelineError {
    match err {
        ProcessError::TimedOut { .. } => PipelineError::InternalTimeout {
            stage: Stage::FetchingSource,
            timeout,
        },
        other => PipelineError::UnprocessableMedia {
            message: format!("Failed to merge video and audio streams: {}", other),
            stderr_tail: other.stderr_tail().to_string(),
        },
    }
}

/// Fetcher that transfers the selected streams over HTTP under the shared limiter
pub struct HttpFetcher {
    resolver: Arc<dyn StreamResolver>,
    merger: Arc<dyn StreamMerger>,
    client: Client,
    limiter: RateLimiter,
    retry: RetryPolicy,
    /// Upper bound on the transfers of one attempt
    attempt_timeout: Duration,
    metrics: Metrics,
}

impl HttpFetcher {
    pub fn new(
        resolver: Arc<dyn StreamResolver>,
        merger: Arc<dyn StreamMerger>,
        limiter: RateLimiter,
        retry: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self {
            resolver,
            merger,
            client,
            limiter,
            retry,
            attempt_timeout,
            metrics: Metrics::disabled(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    async fn attempt(
        &self,
        url: &str,
        desired_resolution: u32,
        audio_only: bool,
        output_dir: &Path,
        attempt: u32,
    ) -> Result<PathBuf, PipelineError> {
        if attempt > 1 {
            self.metrics.record_fetch_retry().await;
        }
        let variants = self.resolver.resolve(url).await?;
        let selection = select_streams(&variants, desired_resolution, audio_only).ok_or_else(|| {
            PipelineError::UnsupportedSource(format!("No downloadable stream for {}", url))
        })?;
        let destination = output_dir.join(format!("{}.{}", SOURCE_STEM, selection.extension()));
        let part_stem = format!("{}.part{}", SOURCE_STEM, attempt);

        let fetched = match &selection {
            StreamSelection::Single(variant) => {
                log_variant(url, "", variant);
                let part = output_dir.join(&part_stem);
                self.download(&[(variant, part.as_path())]).await?;
                part
            }
            StreamSelection::Merged { video, audio } => {
                log_variant(url, "video ", video);
                log_variant(url, "audio ", audio);
                let video_part = output_dir.join(format!("{}.video", part_stem));
                let audio_part = output_dir.join(format!("{}.audio", part_stem));
                self.download(&[(video, video_part.as_path()), (audio, audio_part.as_path())])
                    .await?;

                // ffmpeg picks the container from the output extension
                let merged = output_dir.join(format!("{}.{}", part_stem, selection.extension()));
                let result = self.merger.merge(&video_part, &audio_part, &merged).await;
                remove_file_logged(&video_part);
                remove_file_logged(&audio_part);
                if let Err(e) = result {
                    remove_file_logged(&merged);
                    return Err(e);
                }
                merged
            }
        };

        if let Err(e) = fs::rename(&fetched, &destination) {
            remove_file_logged(&fetched);
            return Err(PipelineError::TransientNetwork(format!(
                "Failed to finalize download: {}",
                e
            )));
        }
        info!("Fetched {} into {}", url, destination.display());
        Ok(destination)
    }

    /// Transfer each variant to its part file under one attempt timeout.
    /// Every part is removed if any transfer fails.
    async fn download(&self, parts: &[(&StreamVariant, &Path)]) -> Result<u64, PipelineError> {
        let transfers = async {
            let mut total: u64 = 0;
            for (variant, part) in parts {
                total += self.transfer(variant, part).await?;
            }
            Ok::<u64, PipelineError>(total)
        };
        let result = match tokio::time::timeout(self.attempt_timeout, transfers).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::TransientNetwork(format!(
                "Transfer timed out after {} seconds",
                self.attempt_timeout.as_secs()
            ))),
        };

        match result {
            Ok(bytes) => {
                debug!("Transferred {} bytes in {} part(s)", bytes, parts.len());
                Ok(bytes)
            }
            Err(e) => {
                for (_, part) in parts {
                    remove_file_logged(part);
                }
                Err(e)
            }
        }
    }

    async fn transfer(&self, variant: &StreamVariant, part: &Path) -> Result<u64, PipelineError> {
        let mut request = self.client.get(&variant.url);
        for (name, value) in &variant.http_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::TransientNetwork(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status()));
        }

        let mut file = tokio::fs::File::create(part).await.map_err(|e| {
            PipelineError::TransientNetwork(format!("Failed to create {}: {}", part.display(), e))
        })?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::TransientNetwork(e.to_string()))?;
            self.limiter.acquire(chunk.len() as u64).await;
            file.write_all(&chunk)
                .await
                .map_err(|e| PipelineError::TransientNetwork(format!("Write failed: {}", e)))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("Write failed: {}", e)))?;

        if written == 0 {
            return Err(PipelineError::TransientNetwork(
                "Downloaded file is empty".to_string(),
            ));
        }
        Ok(written)
    }
}

fn log_variant(url: &str, role: &str, variant: &StreamVariant) {
    info!(
        "Fetching {} {}format {} ({}p, {} kbit/s)",
        url,
        role,
        variant.format_id,
        variant.height.unwrap_or(0),
        variant.bitrate_or_zero()
    );
}

fn remove_file_logged(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            error!("Failed to remove partial download {}: {}", path.display(), e);
        }
    }
}

/// Delete every partial download left in `dir`
fn remove_partials(dir: &Path) {
    let prefix = format!("{}.part", SOURCE_STEM);
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                remove_file_logged(&entry.path());
            }
        }
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        desired_resolution: u32,
        audio_only: bool,
        output_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let url = validate_reference(url)?;
        let url = url.as_str();

        let result = self
            .retry
            .run("Fetch", |attempt| {
                self.attempt(url, desired_resolution, audio_only, output_dir, attempt)
            })
            .await;

        if let Err(e) = &result {
            error!("Fetching {} failed: {}", url, e);
            remove_partials(output_dir);
        }
        result
    }
}
