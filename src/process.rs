//! External process runner shared by every stage
//!
//! Each invocation is bounded by a timeout and the child is killed when its future is
//! dropped, which is how cancellation reaches an in-flight ffmpeg/whisper/yt-dlp run.

use log::debug;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Number of stderr lines kept for diagnostics
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed {
        program: String,
        status: String,
        stderr_tail: String,
    },

    #[error("{program} timed out after {} seconds", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
}

impl ProcessError {
    /// Diagnostic text from the child, if it ran far enough to produce any
    pub fn stderr_tail(&self) -> &str {
        match self {
            ProcessError::Failed { stderr_tail, .. } => stderr_tail,
            _ => "",
        }
    }
}

/// Run `command` to completion, capturing stdout and stderr
pub async fn run_command(mut command: Command, timeout: Duration) -> Result<CommandOutput, ProcessError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Running {:?}", command.as_std());

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(result) => result.map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?,
        Err(_) => return Err(ProcessError::TimedOut { program, timeout }),
    };

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(ProcessError::Failed {
            program,
            status: output.status.to_string(),
            stderr_tail: tail_lines(&stderr, STDERR_TAIL_LINES),
        });
    }

    Ok(CommandOutput {
        stdout: output.stdout,
        stderr,
    })
}

/// Version reported by `<program> -version`, e.g. "6.1.1" for ffmpeg
pub async fn tool_version(program: &str, timeout: Duration) -> Result<String, ProcessError> {
    let mut command = Command::new(program);
    command.arg("-version");
    let output = run_command(command, timeout).await?;
    Ok(version_from_banner(&String::from_utf8_lossy(&output.stdout)))
}

/// Third word of the first banner line ("ffmpeg version 6.1.1 Copyright ...")
fn version_from_banner(banner: &str) -> String {
    banner
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(2))
        .unwrap_or("unknown")
        .to_string()
}

/// Last `max_lines` non-empty lines of `text`
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
