//! Subtitle embedding stage
//!
//! Muxes the subtitle document into the source video as a selectable (soft) track.
//! Video and audio streams are stream-copied, never re-encoded.

use async_trait::async_trait;
use log::{error, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::process::{run_command, ProcessError};
use crate::subtitles::SubtitleDocument;
use crate::task::{PipelineError, Stage};

/// Scratch track written for the mux and removed afterwards
const EMBED_TRACK_FILE_NAME: &str = "embed_track.srt";

#[async_trait]
pub trait SubtitleEmbedder: Send + Sync {
    /// Write `<stem>_with_subtitles.<ext>` into `output_dir` and return its path
    async fn embed(
        &self,
        video: &Path,
        document: &SubtitleDocument,
        language: &str,
        output_dir: &Path,
    ) -> Result<PathBuf, PipelineError>;
}

/// Subtitle codec the container accepts without re-encoding other streams
pub fn subtitle_codec_for(video: &Path) -> &'static str {
    let extension = video
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp4" | "m4v" | "mov" => "mov_text",
        "webm" => "webvtt",
        _ => "srt",
    }
}

pub fn embedded_output_path(video: &Path, output_dir: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    let extension = video
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mkv");
    output_dir.join(format!("{}_with_subtitles.{}", stem, extension))
}

pub struct FfmpegSubtitleEmbedder {
    ffmpeg_path: String,
    timeout: Duration,
}

impl FfmpegSubtitleEmbedder {
    pub fn new(ffmpeg_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout,
        }
    }

    fn build_command(&self, video: &Path, track: &Path, output: &Path, language: &str) -> Command {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .arg("-nostdin")
            .arg("-hide_banner")
            .arg("-y")
            .arg("-i")
            .arg(video)
            .arg("-i")
            .arg(track)
            .arg("-map")
            .arg("0:v?")
            .arg("-map")
            .arg("0:a?")
            .arg("-map")
            .arg("1:0")
            .arg("-c:v")
            .arg("copy")
            .arg("-c:a")
            .arg("copy")
            .arg("-c:s")
            .arg(subtitle_codec_for(video))
            .arg("-metadata:s:s:0")
            .arg(format!("language={}", language))
            .arg(output);
        command
    }
}

fn remove_if_exists(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            error!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl SubtitleEmbedder for FfmpegSubtitleEmbedder {
    async fn embed(
        &self,
        video: &Path,
        document: &SubtitleDocument,
        language: &str,
        output_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        if document.is_empty() {
            return Err(PipelineError::EmbeddingFailed(
                "Subtitle document has no cues to embed".to_string(),
            ));
        }

        let track = output_dir.join(EMBED_TRACK_FILE_NAME);
        fs::write(&track, document.to_srt()).map_err(|e| {
            PipelineError::EmbeddingFailed(format!("Failed to write subtitle track: {}", e))
        })?;

        let output = embedded_output_path(video, output_dir);
        info!(
            "Embedding {} cues into {} ({})",
            document.len(),
            output.display(),
            subtitle_codec_for(video)
        );

        let result = run_command(
            self.build_command(video, &track, &output, language),
            self.timeout,
        )
        .await;
        remove_if_exists(&track);

        match result {
            Ok(_) => Ok(output),
            Err(e) => {
                remove_if_exists(&output);
                Err(classify_embed_error(e, self.timeout))
            }
        }
    }
}

fn classify_embed_error(err: ProcessError, timeout: Duration) -> PipelineError {
    match err {
        ProcessError::TimedOut { .. } => PipelineError::InternalTimeout {
            stage: Stage::EmbeddingSubtitles,
            timeout,
        },
        other => PipelineError::EmbeddingFailed(format!("{}\n{}", other, other.stderr_tail())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtitles::{SubtitleAssembler, TimedSegment};

    #[test]
    fn test_codec_depends_on_container() {
        assert_eq!(subtitle_codec_for(Path::new("a.mp4")), "mov_text");
        assert_eq!(subtitle_codec_for(Path::new("a.MOV")), "mov_text");
        assert_eq!(subtitle_codec_for(Path::new("a.webm")), "webvtt");
        assert_eq!(subtitle_codec_for(Path::new("a.mkv")), "srt");
        assert_eq!(subtitle_codec_for(Path::new("noext")), "srt");
    }

    #[test]
    fn test_output_path_keeps_container() {
        let out = embedded_output_path(Path::new("/in/clip.mp4"), Path::new("/work"));
        assert_eq!(out, PathBuf::from("/work/clip_with_subtitles.mp4"));
    }

    #[test]
    fn test_command_stream_copies_and_tags_language() {
        let embedder = FfmpegSubtitleEmbedder::new("ffmpeg", Duration::from_secs(5));
        let command = embedder.build_command(
            Path::new("clip.mp4"),
            Path::new("track.srt"),
            Path::new("out.mp4"),
            "fr",
        );
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "copy"));
        assert!(args.windows(2).any(|w| w[0] == "-c:a" && w[1] == "copy"));
        assert!(args.windows(2).any(|w| w[0] == "-c:s" && w[1] == "mov_text"));
        assert!(args.windows(2).any(|w| w[0] == "-metadata:s:s:0" && w[1] == "language=fr"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_cleans_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"not really a video").unwrap();
        let document = SubtitleAssembler::new(1).assemble(&[TimedSegment::new(0, 1000, "hi")]);

        let embedder = FfmpegSubtitleEmbedder::new("false", Duration::from_secs(5));
        let err = embedder.embed(&video, &document, "en", dir.path()).await.unwrap_err();

        assert!(matches!(err, PipelineError::EmbeddingFailed(_)));
        assert!(!dir.path().join(EMBED_TRACK_FILE_NAME).exists());
        assert!(!dir.path().join("clip_with_subtitles.mp4").exists());
    }

    #[test]
    fn test_timeout_is_internal_timeout() {
        let err = classify_embed_error(
            ProcessError::TimedOut {
                program: "ffmpeg".into(),
                timeout: Duration::from_secs(5),
            },
            Duration::from_secs(5),
        );
        assert!(matches!(
            err,
            PipelineError::InternalTimeout { stage: Stage::EmbeddingSubtitles, timeout }
                if timeout == Duration::from_secs(5)
        ));
    }

    #[test]
    fn test_mux_failure_keeps_stderr_tail() {
        let err = classify_embed_error(
            ProcessError::Failed {
                program: "ffmpeg".into(),
                status: "exit status: 1".into(),
                stderr_tail: "Subtitle codec 94213 is not supported".into(),
            },
            Duration::from_secs(5),
        );
        match err {
            PipelineError::EmbeddingFailed(message) => assert!(message.contains("not supported")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = FfmpegSubtitleEmbedder::new("ffmpeg", Duration::from_secs(5));
        let err = embedder
            .embed(Path::new("clip.mp4"), &SubtitleDocument::default(), "en", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmbeddingFailed(_)));
    }
}
