//! Audio extraction stage
//!
//! Normalizes any input media into the canonical waveform the ASR engine expects:
//! mono, fixed sample rate, 16-bit PCM WAV.

use async_trait::async_trait;
use log::{error, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::process::{run_command, ProcessError};
use crate::task::{PipelineError, Stage};

/// File name of the canonical waveform inside a task directory
pub const WAVEFORM_FILE_NAME: &str = "audio.wav";

#[async_trait]
pub trait AudioExtractor: Send + Sync {
    /// Write the canonical waveform for `media` into `output_dir` and return its path
    async fn extract(&self, media: &Path, output_dir: &Path) -> Result<PathBuf, PipelineError>;
}

pub struct FfmpegAudioExtractor {
    ffmpeg_path: String,
    sample_rate: u32,
    timeout: Duration,
}

impl FfmpegAudioExtractor {
    pub fn new(ffmpeg_path: impl Into<String>, sample_rate: u32, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            sample_rate,
            timeout,
        }
    }

    fn build_command(&self, media: &Path, waveform: &Path) -> Command {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .arg("-nostdin")
            .arg("-hide_banner")
            .arg("-y")
            .arg("-i")
            .arg(media)
            .arg("-map")
            .arg("0:a:0")
            .arg("-vn")
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(self.sample_rate.to_string())
            .arg("-c:a")
            .arg("pcm_s16le")
            .arg(waveform);
        command
    }
}

#[async_trait]
impl AudioExtractor for FfmpegAudioExtractor {
    async fn extract(&self, media: &Path, output_dir: &Path) -> Result<PathBuf, PipelineError> {
        let waveform = output_dir.join(WAVEFORM_FILE_NAME);
        info!("Extracting audio from {} to {}", media.display(), waveform.display());

        let result = run_command(self.build_command(media, &waveform), self.timeout).await;

        match result {
            Ok(_) => Ok(waveform),
            Err(e) => {
                if waveform.exists() {
                    if let Err(rm) = fs::remove_file(&waveform) {
                        error!("Failed to remove partial waveform {}: {}", waveform.display(), rm);
                    }
                }
                Err(classify_extract_error(e, self.timeout))
            }
        }
    }
}

fn classify_extract_error(err: ProcessError, timeout: Duration) -> PipelineError {
    match err {
        ProcessError::TimedOut { .. } => PipelineError::InternalTimeout {
            stage: Stage::ExtractingAudio,
            timeout,
        },
        ProcessError::Failed { stderr_tail, .. } => {
            let message = if stderr_tail.contains("matches no streams")
                || stderr_tail.contains("does not contain any stream")
            {
                "Source has no audio stream".to_string()
            } else {
                "Transcoding tool rejected the source".to_string()
            };
            PipelineError::UnprocessableMedia {
                message,
                stderr_tail,
            }
        }
        spawn @ ProcessError::Spawn { .. } => PipelineError::UnprocessableMedia {
            message: spawn.to_string(),
            stderr_tail: String::new(),
        },
    }
}
