//! Task orchestrator
//!
//! Accepts task requests, runs each task on its own tokio task through the ordered
//! stage list, and owns the task's state for its whole lifetime. The number of tasks
//! running stages at once is bounded by a semaphore sized to the worker pool; tasks
//! waiting for a permit stay `Queued`.
//!
//! Cancellation is checked at every stage boundary and raced against the running
//! stage. Dropping the stage future kills any external process it spawned.

pub mod stages;

#[cfg(test)]
mod tests;

use chrono::Utc;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::audio::FfmpegAudioExtractor;
use crate::config::{PipelineConfig, ServerConfig, TaskPaths};
use crate::embedder::FfmpegSubtitleEmbedder;
use crate::fetcher::{validate_reference, FfmpegStreamMerger, HttpFetcher, YtDlpResolver};
use crate::file_utils::{cleanup_folder, generate_unique_task_paths, remove_dir_contents_except};
use crate::metrics::Metrics;
use crate::rate_limiter::RateLimiter;
use crate::registry::TaskRegistry;
use crate::subtitles::SubtitleAssembler;
use crate::task::{
    ArtifactKind, InputDescriptor, PipelineError, Stage, Task, TaskArtifacts, TaskError,
    TaskLookupError, TaskOptions, TaskRequestError, TaskStatus,
};
use crate::transcriber::WhisperTranscriber;

pub use stages::{Collaborators, PipelineStage, TaskContext};

#[derive(Clone)]
pub struct Orchestrator {
    registry: TaskRegistry,
    stages: Arc<Vec<Box<dyn PipelineStage>>>,
    permits: Arc<Semaphore>,
    config: Arc<PipelineConfig>,
    metrics: Metrics,
    active: Arc<AtomicUsize>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        registry: TaskRegistry,
        stages: Vec<Box<dyn PipelineStage>>,
        metrics: Metrics,
    ) -> Self {
        let workers = config.max_concurrent_tasks.max(1);
        info!("Orchestrator started with {} workers", workers);
        Self {
            registry,
            stages: Arc::new(stages),
            permits: Arc::new(Semaphore::new(workers)),
            config: Arc::new(config),
            metrics,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Standard pipeline over the given collaborators
    pub fn with_collaborators(
        config: PipelineConfig,
        registry: TaskRegistry,
        collaborators: Collaborators,
        metrics: Metrics,
    ) -> Self {
        let assembler = SubtitleAssembler::new(config.min_cue_duration_ms);
        let stages = stages::standard_pipeline(collaborators, assembler);
        Self::new(config, registry, stages, metrics)
    }

    /// Standard pipeline backed by yt-dlp, ffmpeg and Whisper
    pub fn from_config(config: PipelineConfig, metrics: Metrics) -> Self {
        let limiter = RateLimiter::new(config.fetch_rate_limit_bytes);
        let resolver = Arc::new(YtDlpResolver::new(&config.ytdlp_cmd, config.fetch_timeout));
        let merger = Arc::new(FfmpegStreamMerger::new(&config.ffmpeg_cmd, config.extract_timeout));
        let fetcher = HttpFetcher::new(
            resolver,
            merger,
            limiter,
            config.retry_policy(),
            config.fetch_timeout,
        )
        .with_metrics(metrics.clone());

        let collaborators = Collaborators {
            fetcher: Arc::new(fetcher),
            extractor: Arc::new(FfmpegAudioExtractor::new(
                &config.ffmpeg_cmd,
                config.audio_sample_rate,
                config.extract_timeout,
            )),
            transcriber: Arc::new(WhisperTranscriber::new(config.whisper.clone())),
            embedder: Arc::new(FfmpegSubtitleEmbedder::new(
                &config.ffmpeg_cmd,
                config.embed_timeout,
            )),
        };
        Self::with_collaborators(config, TaskRegistry::new(), collaborators, metrics)
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Tasks currently holding a worker permit
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Allocate a task id and its working directory, e.g. to receive an upload
    pub fn reserve_task(&self) -> Result<TaskPaths, TaskRequestError> {
        Ok(generate_unique_task_paths(&self.config.work_dir)?)
    }

    /// Create a task in a fresh working directory and start it
    pub async fn create_task(
        &self,
        input: InputDescriptor,
        options: TaskOptions,
    ) -> Result<String, TaskRequestError> {
        validate_request(&input, &options)?;
        let paths = self.reserve_task()?;
        self.submit(paths, input, options).await
    }

    /// Start a task in a directory obtained from [`Orchestrator::reserve_task`].
    /// A rejected request removes the directory.
    pub async fn submit(
        &self,
        paths: TaskPaths,
        input: InputDescriptor,
        options: TaskOptions,
    ) -> Result<String, TaskRequestError> {
        if let Err(e) = validate_request(&input, &options) {
            cleanup_folder(&paths.folder);
            return Err(e);
        }

        let task = Task::new(paths.id.clone(), input, options, paths.folder);
        let input_label = task.input.label();
        let token = self.registry.insert(task.clone()).await;
        self.metrics.record_task_created(input_label).await;
        info!("Task {} queued ({} input)", paths.id, input_label);

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_task(task, token).await;
        });

        Ok(paths.id)
    }

    pub async fn get_status(&self, id: &str) -> Result<TaskStatus, TaskLookupError> {
        self.registry.status(id).await
    }

    pub async fn list_tasks(&self) -> Vec<TaskStatus> {
        self.registry.list().await
    }

    /// Path of a finished artifact
    pub async fn get_artifact(&self, id: &str, kind: ArtifactKind) -> Result<PathBuf, TaskLookupError> {
        let task = self.registry.get(id).await?;
        let artifacts = match (&task.stage, task.artifacts) {
            (Stage::Completed, Some(artifacts)) => artifacts,
            _ => return Err(TaskLookupError::NotReady(id.to_string())),
        };
        match kind {
            ArtifactKind::Subtitle => Ok(artifacts.subtitle_path),
            ArtifactKind::Video => artifacts
                .video_path
                .ok_or_else(|| TaskLookupError::NoSuchArtifact(id.to_string(), kind)),
        }
    }

    pub async fn cancel_task(&self, id: &str) -> Result<(), TaskLookupError> {
        self.registry.cancel(id).await?;
        info!("Cancellation requested for task {}", id);
        Ok(())
    }

    /// Forget a finished task and remove its working directory
    pub async fn reap_task(&self, id: &str) -> Result<(), TaskLookupError> {
        let task = self.registry.remove_terminal(id).await?;
        cleanup_folder(&task.work_dir);
        info!("Reaped task {}", id);
        Ok(())
    }

    /// Reap every task that finished more than `max_age` ago
    pub async fn reap_expired(&self, max_age: std::time::Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let mut reaped = 0;
        for id in self.registry.finished_before(cutoff).await {
            match self.reap_task(&id).await {
                Ok(()) => reaped += 1,
                Err(e) => warn!("Failed to reap expired task {}: {}", id, e),
            }
        }
        reaped
    }

    /// Periodically reap tasks older than the configured retention.
    /// Returns false, without starting anything, when the interval is zero.
    pub fn start_reaper(&self) -> bool {
        let orchestrator = self.clone();
        let retention = self.config.task_retention;
        let interval = self.config.cleanup_interval;
        if interval.is_zero() {
            error!("Task reaper not started: cleanup interval must be greater than zero");
            return false;
        }
        info!(
            "Starting task reaper: retention {} hours, interval {} hours",
            retention.as_secs() / 3600,
            interval.as_secs() / 3600
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reaped = orchestrator.reap_expired(retention).await;
                if reaped > 0 {
                    info!("Reaped {} expired tasks", reaped);
                } else {
                    debug!("No expired tasks to reap");
                }
            }
        });
        true
    }

    async fn run_task(self, task: Task, token: CancellationToken) {
        let mut ctx = TaskContext::new(&task);

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };

        let result = match permit {
            None => Err(PipelineError::Cancelled),
            Some(_permit) => {
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.metrics.set_active_tasks(active).await;

                let result = self.run_stages(&mut ctx, &token).await;

                let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
                self.metrics.set_active_tasks(active).await;
                result
            }
        };

        self.finish(&ctx, result).await;
    }

    async fn run_stages(
        &self,
        ctx: &mut TaskContext,
        token: &CancellationToken,
    ) -> Result<TaskArtifacts, PipelineError> {
        for stage in self.stages.iter() {
            if !stage.applies(ctx) {
                continue;
            }
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let name = stage.stage();
            match self.registry.enter_stage(&ctx.task_id, name).await {
                Ok(true) => info!("Task {} entered {}", ctx.task_id, name),
                Ok(false) => warn!("Task {} refused transition to {}", ctx.task_id, name),
                Err(e) => warn!("Task {} vanished from the registry: {}", ctx.task_id, e),
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(PipelineError::Cancelled),
                outcome = stage.run(ctx) => outcome,
            };
            self.metrics
                .record_stage_duration(name.as_str(), started.elapsed().as_secs_f64())
                .await;
            outcome?;
        }

        let subtitle_path = ctx.subtitle_path.clone().ok_or_else(|| {
            PipelineError::TranscriptionFailed("No subtitle document was produced".to_string())
        })?;
        Ok(TaskArtifacts {
            subtitle_path,
            video_path: ctx.video_path.clone(),
        })
    }

    async fn finish(&self, ctx: &TaskContext, result: Result<TaskArtifacts, PipelineError>) {
        let caller_source = ctx
            .source
            .as_deref()
            .filter(|_| ctx.source_owned_by_caller);

        match result {
            Ok(artifacts) => {
                let mut keep: Vec<&Path> = vec![artifacts.subtitle_path.as_path()];
                keep.extend(artifacts.video_path.as_deref());
                keep.extend(caller_source);
                remove_dir_contents_except(&ctx.work_dir, &keep);

                if let Err(e) = self.registry.complete(&ctx.task_id, artifacts).await {
                    error!("Failed to record completion of task {}: {}", ctx.task_id, e);
                }
                self.metrics.record_task_finished("completed", "none").await;
                info!("Task {} completed", ctx.task_id);
            }
            Err(err) => {
                let keep: Vec<&Path> = caller_source.into_iter().collect();
                remove_dir_contents_except(&ctx.work_dir, &keep);

                let record = TaskError::from(&err);
                self.metrics
                    .record_task_finished("failed", record.kind.as_str())
                    .await;
                error!("Task {} failed ({}): {}", ctx.task_id, record.kind, err);
                if let Err(e) = self.registry.fail(&ctx.task_id, record).await {
                    error!("Failed to record failure of task {}: {}", ctx.task_id, e);
                }
            }
        }
    }
}

/// Reject requests that can never succeed before any work is queued
fn validate_request(input: &InputDescriptor, options: &TaskOptions) -> Result<(), TaskRequestError> {
    if options.language.trim().is_empty() {
        return Err(TaskRequestError::InvalidOptions(
            "language must not be empty".to_string(),
        ));
    }
    match input {
        InputDescriptor::UploadedFile { path } => {
            if !path.is_file() {
                return Err(TaskRequestError::InvalidOptions(format!(
                    "uploaded file {} does not exist",
                    path.display()
                )));
            }
            let audio_upload = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(ServerConfig::is_audio_extension);
            if audio_upload && options.embed_subtitles {
                return Err(TaskRequestError::InvalidOptions(
                    "cannot embed subtitles into an audio-only source".to_string(),
                ));
            }
        }
        InputDescriptor::RemoteReference {
            url,
            desired_resolution,
            audio_only,
        } => {
            validate_reference(url).map_err(|e| TaskRequestError::UnsupportedSource(e.to_string()))?;
            if *desired_resolution == 0 {
                return Err(TaskRequestError::InvalidOptions(
                    "resolution must be greater than zero".to_string(),
                ));
            }
            if *audio_only && options.embed_subtitles {
                return Err(TaskRequestError::InvalidOptions(
                    "cannot embed subtitles into an audio-only source".to_string(),
                ));
            }
        }
    }
    Ok(())
}
