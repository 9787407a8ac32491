//! Pipeline stages
//!
//! Each stage reads what earlier stages left in the [`TaskContext`] and records its own
//! output there. The orchestrator iterates them in order and applies cancellation,
//! cleanup and bookkeeping uniformly.

use async_trait::async_trait;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audio::AudioExtractor;
use crate::embedder::SubtitleEmbedder;
use crate::fetcher::RemoteFetcher;
use crate::file_utils::remove_file_if_exists;
use crate::subtitles::{SubtitleAssembler, SubtitleDocument, TimedSegment};
use crate::task::{InputDescriptor, PipelineError, Stage, Task, TaskOptions};
use crate::transcriber::Transcriber;

/// Name of the subtitle document inside a task directory, before the extension
pub const SUBTITLE_FILE_STEM: &str = "subtitles";

/// Working state threaded through the stages of one task
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub input: InputDescriptor,
    pub options: TaskOptions,
    pub work_dir: PathBuf,
    /// Local media the later stages read
    pub source: Option<PathBuf>,
    /// Whether `source` belongs to the caller and must survive cleanup
    pub source_owned_by_caller: bool,
    pub waveform: Option<PathBuf>,
    pub segments: Vec<TimedSegment>,
    pub document: Option<SubtitleDocument>,
    pub subtitle_path: Option<PathBuf>,
    pub video_path: Option<PathBuf>,
}

impl TaskContext {
    pub fn new(task: &Task) -> Self {
        let source = match &task.input {
            InputDescriptor::UploadedFile { path } => Some(path.clone()),
            InputDescriptor::RemoteReference { .. } => None,
        };
        Self {
            task_id: task.id.clone(),
            input: task.input.clone(),
            options: task.options.clone(),
            work_dir: task.work_dir.clone(),
            source_owned_by_caller: source.is_some(),
            source,
            waveform: None,
            segments: Vec::new(),
            document: None,
            subtitle_path: None,
            video_path: None,
        }
    }

    fn require_source(&self) -> Result<&Path, PipelineError> {
        self.source
            .as_deref()
            .ok_or_else(|| PipelineError::UnprocessableMedia {
                message: "No local source available".to_string(),
                stderr_tail: String::new(),
            })
    }
}

/// One step of the pipeline
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Stage the task enters while this step runs
    fn stage(&self) -> Stage;

    fn applies(&self, _ctx: &TaskContext) -> bool {
        true
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), PipelineError>;
}

pub struct FetchSourceStage {
    fetcher: Arc<dyn RemoteFetcher>,
}

impl FetchSourceStage {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl PipelineStage for FetchSourceStage {
    fn stage(&self) -> Stage {
        Stage::FetchingSource
    }

    fn applies(&self, ctx: &TaskContext) -> bool {
        ctx.input.is_remote()
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), PipelineError> {
        if let InputDescriptor::RemoteReference {
            url,
            desired_resolution,
            audio_only,
        } = &ctx.input
        {
            let path = self
                .fetcher
                .fetch(url, *desired_resolution, *audio_only, &ctx.work_dir)
                .await?;
            ctx.source = Some(path);
            ctx.source_owned_by_caller = false;
        }
        Ok(())
    }
}

pub struct ExtractAudioStage {
    extractor: Arc<dyn AudioExtractor>,
}

impl ExtractAudioStage {
    pub fn new(extractor: Arc<dyn AudioExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl PipelineStage for ExtractAudioStage {
    fn stage(&self) -> Stage {
        Stage::ExtractingAudio
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), PipelineError> {
        let source = ctx.require_source()?.to_path_buf();
        let waveform = self.extractor.extract(&source, &ctx.work_dir).await?;
        ctx.waveform = Some(waveform);
        Ok(())
    }
}

pub struct TranscribeStage {
    transcriber: Arc<dyn Transcriber>,
}

impl TranscribeStage {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }
}

#[async_trait]
impl PipelineStage for TranscribeStage {
    fn stage(&self) -> Stage {
        Stage::Transcribing
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), PipelineError> {
        let waveform = ctx
            .waveform
            .clone()
            .ok_or_else(|| PipelineError::TranscriptionFailed("No waveform to transcribe".into()))?;

        let segments = self
            .transcriber
            .transcribe(&waveform, Some(&ctx.options.language), ctx.options.translate)
            .await?;

        // the waveform is only an input to transcription
        remove_file_if_exists(&waveform);
        ctx.waveform = None;
        ctx.segments = segments;
        Ok(())
    }
}

pub struct AssembleStage {
    assembler: SubtitleAssembler,
}

impl AssembleStage {
    pub fn new(assembler: SubtitleAssembler) -> Self {
        Self { assembler }
    }
}

#[async_trait]
impl PipelineStage for AssembleStage {
    fn stage(&self) -> Stage {
        Stage::AssemblingSubtitles
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), PipelineError> {
        let document = self.assembler.assemble(&ctx.segments);
        if document.is_empty() {
            warn!("Task {} produced an empty subtitle document", ctx.task_id);
        }

        let format = ctx.options.subtitle_format;
        let path = ctx
            .work_dir
            .join(format!("{}.{}", SUBTITLE_FILE_STEM, format.extension()));
        fs::write(&path, document.render(format)).map_err(|e| {
            PipelineError::TranscriptionFailed(format!(
                "Failed to write subtitle document {}: {}",
                path.display(),
                e
            ))
        })?;

        info!(
            "Task {}: assembled {} cues into {}",
            ctx.task_id,
            document.len(),
            path.display()
        );
        ctx.subtitle_path = Some(path);
        ctx.document = Some(document);
        Ok(())
    }
}

pub struct EmbedStage {
    embedder: Arc<dyn SubtitleEmbedder>,
}

impl EmbedStage {
    pub fn new(embedder: Arc<dyn SubtitleEmbedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl PipelineStage for EmbedStage {
    fn stage(&self) -> Stage {
        Stage::EmbeddingSubtitles
    }

    fn applies(&self, ctx: &TaskContext) -> bool {
        ctx.options.embed_subtitles
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<(), PipelineError> {
        let video = ctx
            .require_source()
            .map_err(|_| PipelineError::EmbeddingFailed("No source video to embed into".into()))?
            .to_path_buf();
        let document = ctx
            .document
            .as_ref()
            .ok_or_else(|| PipelineError::EmbeddingFailed("No subtitle document".into()))?;

        let output = self
            .embedder
            .embed(&video, document, &ctx.options.language, &ctx.work_dir)
            .await?;
        ctx.video_path = Some(output);
        Ok(())
    }
}

/// Collaborators the standard pipeline is built from
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn RemoteFetcher>,
    pub extractor: Arc<dyn AudioExtractor>,
    pub transcriber: Arc<dyn Transcriber>,
    pub embedder: Arc<dyn SubtitleEmbedder>,
}

/// Fetch, extract, transcribe, assemble, embed
pub fn standard_pipeline(
    collaborators: Collaborators,
    assembler: SubtitleAssembler,
) -> Vec<Box<dyn PipelineStage>> {
    vec![
        Box::new(FetchSourceStage::new(collaborators.fetcher)),
        Box::new(ExtractAudioStage::new(collaborators.extractor)),
        Box::new(TranscribeStage::new(collaborators.transcriber)),
        Box::new(AssembleStage::new(assembler)),
        Box::new(EmbedStage::new(collaborators.embedder)),
    ]
}
