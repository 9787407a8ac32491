//! Speech recognition stage
//!
//! Wraps a Whisper/WhisperX command-line engine. The engine writes a JSON result next to
//! the waveform; segments are read back in emission order and lightly normalized.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::process::{run_command, ProcessError};
use crate::subtitles::{TimedSegment, MIN_UNIT_MS};
use crate::task::{PipelineError, Stage};

const DEFAULT_WHISPER_CMD: &str = "whisperx";
const DEFAULT_WHISPER_MODEL: &str = "base";
const DEFAULT_TRANSCRIBE_TIMEOUT_SECONDS: u64 = 7200;

/// Configuration for the ASR command
#[derive(Clone, Debug)]
pub struct WhisperConfig {
    /// Path to the Whisper command
    pub command_path: String,
    /// Model name (e.g. "base", "large-v3")
    pub model: String,
    /// Directory holding downloaded models, if the engine needs one
    pub models_dir: Option<String>,
    /// Upper bound on a single transcription run
    pub timeout: Duration,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            command_path: std::env::var("WHISPER_CMD")
                .unwrap_or_else(|_| String::from(DEFAULT_WHISPER_CMD)),
            model: std::env::var("WHISPER_MODEL")
                .unwrap_or_else(|_| String::from(DEFAULT_WHISPER_MODEL)),
            models_dir: std::env::var("WHISPER_MODELS_DIR").ok(),
            timeout: Duration::from_secs(
                std::env::var("TRANSCRIBE_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_TRANSCRIBE_TIMEOUT_SECONDS),
            ),
        }
    }
}

/// Converts a canonical waveform into timed text
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        waveform: &Path,
        language_hint: Option<&str>,
        translate: bool,
    ) -> Result<Vec<TimedSegment>, PipelineError>;
}

/// Segment as emitted by the engine, offsets in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct EngineOutput {
    #[serde(default)]
    segments: Vec<RawSegment>,
    #[serde(default)]
    language: Option<String>,
}

pub struct WhisperTranscriber {
    config: WhisperConfig,
}

impl WhisperTranscriber {
    pub fn new(config: WhisperConfig) -> Self {
        Self { config }
    }

    fn build_command(
        &self,
        waveform: &Path,
        output_dir: &Path,
        language_hint: Option<&str>,
        translate: bool,
    ) -> Command {
        let mut command = Command::new(&self.config.command_path);
        command
            .arg(waveform)
            .arg("--model")
            .arg(&self.config.model)
            .arg("--output_dir")
            .arg(output_dir)
            .arg("--output_format")
            .arg("json");

        if let Some(models_dir) = &self.config.models_dir {
            command
                .arg("--model_dir")
                .arg(format!("{}/{}", models_dir, self.config.model));
        }

        if let Some(language) = language_hint {
            command.arg("--language").arg(language);
        }

        if translate {
            command.arg("--task").arg("translate");
        }

        command
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(
        &self,
        waveform: &Path,
        language_hint: Option<&str>,
        translate: bool,
    ) -> Result<Vec<TimedSegment>, PipelineError> {
        let output_dir = waveform
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let language_hint = language_hint.filter(|l| !l.is_empty() && *l != "auto");

        let command = self.build_command(waveform, &output_dir, language_hint, translate);
        run_command(command, self.config.timeout)
            .await
            .map_err(|e| match e {
                ProcessError::TimedOut { timeout, .. } => PipelineError::InternalTimeout {
                    stage: Stage::Transcribing,
                    timeout,
                },
                other => PipelineError::TranscriptionFailed(format!(
                    "{}\n{}",
                    other,
                    other.stderr_tail()
                )),
            })?;

        // The engine names its output after the input file
        let stem = waveform
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audio");
        let result_path = output_dir.join(format!("{}.json", stem));

        let content = fs::read_to_string(&result_path).map_err(|e| {
            PipelineError::TranscriptionFailed(format!(
                "Failed to read engine output {}: {}",
                result_path.display(),
                e
            ))
        })?;
        if let Err(e) = fs::remove_file(&result_path) {
            warn!("Failed to remove engine output {}: {}", result_path.display(), e);
        }

        let output: EngineOutput = serde_json::from_str(&content).map_err(|e| {
            PipelineError::TranscriptionFailed(format!("Invalid engine output: {}", e))
        })?;

        if output.segments.is_empty() {
            return Err(PipelineError::TranscriptionFailed(
                "Engine returned no segments".to_string(),
            ));
        }

        if let Some(language) = &output.language {
            debug!("Engine reported language: {}", language);
        }

        let segments = normalize_segments(output.segments);
        info!(
            "Transcribed {} into {} segments",
            waveform.display(),
            segments.len()
        );
        Ok(segments)
    }
}

fn seconds_to_ms(seconds: f64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    (seconds * 1000.0).round() as u64
}

/// Trim text, drop blank or zero-length segments, and give segments whose end
/// precedes their start a one-unit duration. Order is preserved.
pub fn normalize_segments(raw: Vec<RawSegment>) -> Vec<TimedSegment> {
    raw.into_iter()
        .filter_map(|segment| {
            let text = segment.text.trim();
            if text.is_empty() {
                return None;
            }
            let start_ms = seconds_to_ms(segment.start);
            let end_ms = seconds_to_ms(segment.end);
            let end_ms = if end_ms < start_ms {
                start_ms.saturating_add(MIN_UNIT_MS)
            } else {
                end_ms
            };
            // zero-length, or inverted at the end of the time range
            if end_ms == start_ms {
                return None;
            }
            Some(TimedSegment::new(start_ms, end_ms, text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(start: f64, end: f64, text: &str) -> RawSegment {
        RawSegment {
            start,
            end,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_normalize_trims_and_drops_blank() {
        let segments = normalize_segments(vec![
            raw(0.0, 1.5, "  Hello world  "),
            raw(1.5, 2.0, "   "),
            raw(2.0, 3.25, "\tBye\n"),
        ]);
        assert_eq!(
            segments,
            vec![
                TimedSegment::new(0, 1500, "Hello world"),
                TimedSegment::new(2000, 3250, "Bye"),
            ]
        );
    }

    #[test]
    fn test_normalize_drops_zero_length() {
        let segments = normalize_segments(vec![raw(4.0, 4.0, "ghost"), raw(4.0, 5.0, "real")]);
        assert_eq!(segments, vec![TimedSegment::new(4000, 5000, "real")]);
    }

    #[test]
    fn test_normalize_clamps_inverted_segment() {
        let segments = normalize_segments(vec![raw(7.0, 6.5, "backwards")]);
        assert_eq!(segments, vec![TimedSegment::new(7000, 7001, "backwards")]);
    }

    #[test]
    fn test_normalize_preserves_emission_order() {
        let segments = normalize_segments(vec![raw(5.0, 6.0, "b"), raw(1.0, 2.0, "a")]);
        assert_eq!(segments[0].text, "b");
        assert_eq!(segments[1].text, "a");
    }

    #[test]
    fn test_normalize_absurd_timestamps_do_not_overflow() {
        let segments = normalize_segments(vec![raw(f64::MAX, 1.0, "late"), raw(1.0, 2.0, "ok")]);
        assert_eq!(segments, vec![TimedSegment::new(1000, 2000, "ok")]);
    }

    #[test]
    fn test_engine_output_parses() {
        let json = r#"{"segments":[{"start":0.0,"end":1.2,"text":" hi"}],"language":"en"}"#;
        let output: EngineOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.segments.len(), 1);
        assert_eq!(output.language.as_deref(), Some("en"));
    }

    #[test]
    fn test_command_includes_language_and_translate() {
        let transcriber = WhisperTranscriber::new(WhisperConfig {
            command_path: "whisperx".to_string(),
            model: "small".to_string(),
            models_dir: Some("/models".to_string()),
            timeout: Duration::from_secs(10),
        });
        let command = transcriber.build_command(
            Path::new("/work/audio.wav"),
            Path::new("/work"),
            Some("fr"),
            true,
        );
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(args[0], "/work/audio.wav");
        assert!(args.windows(2).any(|w| w[0] == "--language" && w[1] == "fr"));
        assert!(args.windows(2).any(|w| w[0] == "--task" && w[1] == "translate"));
        assert!(args.windows(2).any(|w| w[0] == "--model_dir" && w[1] == "/models/small"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_failure_is_transcription_failed() {
        let dir = tempfile::tempdir().unwrap();
        let waveform = dir.path().join("audio.wav");
        std::fs::write(&waveform, b"RIFF").unwrap();

        let transcriber = WhisperTranscriber::new(WhisperConfig {
            command_path: "false".to_string(),
            model: "base".to_string(),
            models_dir: None,
            timeout: Duration::from_secs(10),
        });
        let err = transcriber.transcribe(&waveform, Some("en"), false).await.unwrap_err();
        assert!(matches!(err, PipelineError::TranscriptionFailed(_)));
    }

    /// Engine run as `sh audio.wav --model ...`: the waveform file holds the script,
    /// and `$0` is its own path.
    #[cfg(unix)]
    fn scripted_engine(dir: &Path, script: &str, timeout: Duration) -> (WhisperTranscriber, PathBuf) {
        let waveform = dir.join("audio.wav");
        std::fs::write(&waveform, script).unwrap();
        let transcriber = WhisperTranscriber::new(WhisperConfig {
            command_path: "sh".to_string(),
            model: "base".to_string(),
            models_dir: None,
            timeout,
        });
        (transcriber, waveform)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_output_is_read_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let script = concat!(
            "cat > \"${0%.wav}.json\" <<'END'\n",
            r#"{"language": "en", "segments": [{"start": 0.5, "end": 1.75, "text": " Hello "}, {"start": 2.0, "end": 2.0, "text": "ghost"}]}"#,
            "\nEND\n"
        );
        let (transcriber, waveform) = scripted_engine(dir.path(), script, Duration::from_secs(10));

        let segments = transcriber.transcribe(&waveform, Some("en"), false).await.unwrap();

        assert_eq!(segments, vec![TimedSegment::new(500, 1750, "Hello")]);
        assert!(!dir.path().join("audio.json").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_without_segments_is_transcription_failed() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"echo '{"segments": []}' > "${0%.wav}.json""#;
        let (transcriber, waveform) = scripted_engine(dir.path(), script, Duration::from_secs(10));

        let err = transcriber.transcribe(&waveform, None, false).await.unwrap_err();

        match err {
            PipelineError::TranscriptionFailed(message) => {
                assert!(message.contains("no segments"), "{}", message)
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!dir.path().join("audio.json").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_without_output_is_transcription_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (transcriber, waveform) = scripted_engine(dir.path(), "exit 0", Duration::from_secs(10));

        let err = transcriber.transcribe(&waveform, None, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::TranscriptionFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_timeout_is_internal_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (transcriber, waveform) =
            scripted_engine(dir.path(), "exec sleep 30", Duration::from_millis(200));

        let err = transcriber.transcribe(&waveform, None, false).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InternalTimeout { stage: Stage::Transcribing, .. }
        ));
    }
}
