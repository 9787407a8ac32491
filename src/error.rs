// Error handling for the subtitle API
//
// HTTP-facing error type. Library errors from the orchestrator convert into it and
// it renders itself as a JSON error body with the matching status code.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use crate::metrics::MetricsError;
use crate::models::ErrorResponse;
use crate::task::{TaskLookupError, TaskRequestError};

/// Errors that can occur in the subtitle API handlers
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Error when processing multipart form data or a JSON body
    #[error("Form error: {0}")]
    FormError(String),

    /// Error when saving file data
    #[error("File error: {0}")]
    FileError(#[from] io::Error),

    /// Error when no media file was provided
    #[error("No media file provided in the request")]
    NoMediaFile,

    /// Error when the upload extension is not accepted
    #[error("Unsupported file format: {0}. Supported formats are: mp4, avi, mov, mkv, wmv, flv, webm, m4a, mp3, wav")]
    UnsupportedFormat(String),

    /// Error when a subtitle format is not known
    #[error("Invalid subtitle format: {0}. Valid formats are: srt, vtt")]
    InvalidSubtitleFormat(String),

    /// Error when a file is too large
    #[error("File too large: {0} bytes exceeds limit of {1} bytes")]
    FileTooLarge(usize, usize),

    #[error(transparent)]
    Lookup(#[from] TaskLookupError),

    #[error(transparent)]
    Request(TaskRequestError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

impl HandlerError {
    /// Create a new FormError
    pub fn form_error<S: Into<String>>(msg: S) -> Self {
        Self::FormError(msg.into())
    }

    /// Helper to clean up a folder when error occurs
    pub fn with_cleanup(self, folder: Option<&PathBuf>) -> Self {
        if let Some(folder) = folder {
            crate::file_utils::cleanup_folder(folder);
        }
        self
    }
}

impl From<TaskRequestError> for HandlerError {
    fn from(err: TaskRequestError) -> Self {
        match err {
            TaskRequestError::Io(e) => HandlerError::FileError(e),
            other => HandlerError::Request(other),
        }
    }
}

impl ResponseError for HandlerError {
    fn status_code(&self) -> StatusCode {
        match self {
            HandlerError::FormError(_)
            | HandlerError::NoMediaFile
            | HandlerError::UnsupportedFormat(_)
            | HandlerError::InvalidSubtitleFormat(_)
            | HandlerError::Request(_) => StatusCode::BAD_REQUEST,
            HandlerError::FileTooLarge(_, _) => StatusCode::PAYLOAD_TOO_LARGE,
            HandlerError::Lookup(TaskLookupError::TaskNotFound(_))
            | HandlerError::Lookup(TaskLookupError::NoSuchArtifact(_, _)) => StatusCode::NOT_FOUND,
            HandlerError::Lookup(_) => StatusCode::CONFLICT,
            HandlerError::FileError(_) | HandlerError::Metrics(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
            status: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ArtifactKind;

    #[test]
    fn test_status_codes() {
        let cases = vec![
            (HandlerError::NoMediaFile, StatusCode::BAD_REQUEST),
            (HandlerError::UnsupportedFormat("exe".into()), StatusCode::BAD_REQUEST),
            (HandlerError::FileTooLarge(10, 5), StatusCode::PAYLOAD_TOO_LARGE),
            (
                TaskLookupError::TaskNotFound("x".into()).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                TaskLookupError::NoSuchArtifact("x".into(), ArtifactKind::Video).into(),
                StatusCode::NOT_FOUND,
            ),
            (TaskLookupError::NotReady("x".into()).into(), StatusCode::CONFLICT),
            (
                TaskLookupError::AlreadyTerminal("x".into()).into(),
                StatusCode::CONFLICT,
            ),
            (
                TaskRequestError::InvalidOptions("bad".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                TaskRequestError::UnsupportedSource("ftp".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                TaskRequestError::Io(io::Error::new(io::ErrorKind::Other, "disk")).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.status_code(), expected, "{}", error);
        }
    }

    #[test]
    fn test_cleanup_removes_folder() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("task");
        std::fs::create_dir(&folder).unwrap();

        let err = HandlerError::NoMediaFile.with_cleanup(Some(&folder));
        assert!(matches!(err, HandlerError::NoMediaFile));
        assert!(!folder.exists());
    }
}
