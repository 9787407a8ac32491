// Form data processing for the subtitle API
//
// This module handles the extraction of multipart uploads for `POST /tasks`.
// The media file is streamed straight into the task's working directory.

use actix_multipart::{Field, Multipart};
use futures::{StreamExt, TryStreamExt};
use log::{error, info};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::config::{ServerConfig, TaskPaths};
use crate::error::HandlerError;
use crate::models::UploadParams;
use crate::orchestrator::Orchestrator;
use crate::task::SubtitleFormat;

/// Stem of the saved upload inside the task directory
pub const UPLOAD_FILE_STEM: &str = "input";

/// Parse a form boolean ("true", "1", "yes", "on")
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Lowercased extension of an uploaded file name, if accepted
pub fn accepted_extension(filename: &str) -> Result<String, HandlerError> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if ServerConfig::is_allowed_extension(&extension) {
        Ok(extension)
    } else {
        Err(HandlerError::UnsupportedFormat(filename.to_string()))
    }
}

async fn read_text(field: &mut Field, name: &str) -> Result<String, HandlerError> {
    let mut value = String::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| {
            HandlerError::form_error(format!("Error reading field {}: {}", name, e))
        })?;
        if let Ok(s) = std::str::from_utf8(&chunk) {
            value.push_str(s);
        }
    }
    Ok(value.trim().to_string())
}

/// Stream the file field to `path`, enforcing the size limit. Returns the byte count.
async fn save_upload(field: &mut Field, path: &Path, max_size: usize) -> Result<usize, HandlerError> {
    let mut file = File::create(path).await?;
    let mut total_size = 0;

    while let Some(chunk) = field.next().await {
        let data = chunk.map_err(|e| {
            HandlerError::form_error(format!("Error processing file upload: {}", e))
        })?;

        total_size += data.len();
        if total_size > max_size {
            return Err(HandlerError::FileTooLarge(total_size, max_size));
        }
        file.write_all(&data).await?;
    }
    file.flush().await?;
    Ok(total_size)
}

async fn read_fields(
    form: &mut Multipart,
    orchestrator: &Orchestrator,
    config: &ServerConfig,
    params: &mut UploadParams,
    paths: &mut Option<TaskPaths>,
) -> Result<usize, HandlerError> {
    let mut upload_size = 0;

    while let Ok(Some(mut field)) = form.try_next().await {
        let content_disposition = field.content_disposition();
        let field_name = content_disposition
            .and_then(|cd| cd.get_name().map(|name| name.to_string()))
            .unwrap_or_default();
        let filename = content_disposition
            .and_then(|cd| cd.get_filename().map(|name| name.to_string()));

        match field_name.as_str() {
            "language" => {
                let value = read_text(&mut field, &field_name).await?;
                if !value.is_empty() {
                    params.options.language = value;
                }
            }
            "embed_subtitles" => {
                params.options.embed_subtitles = parse_bool(&read_text(&mut field, &field_name).await?);
            }
            "translate" => {
                params.options.translate = parse_bool(&read_text(&mut field, &field_name).await?);
            }
            "subtitle_format" => {
                let value = read_text(&mut field, &field_name).await?;
                if !value.is_empty() {
                    params.options.subtitle_format = SubtitleFormat::parse(&value)
                        .ok_or(HandlerError::InvalidSubtitleFormat(value))?;
                }
            }
            "file" => {
                if paths.is_some() {
                    return Err(HandlerError::form_error("Only one file per request is accepted"));
                }
                let extension = accepted_extension(filename.as_deref().unwrap_or_default())?;

                let reserved = orchestrator.reserve_task()?;
                let media_file = reserved
                    .folder
                    .join(format!("{}.{}", UPLOAD_FILE_STEM, extension));
                *paths = Some(reserved);

                upload_size = save_upload(&mut field, &media_file, config.max_file_size).await?;
                info!("Saved media file: {} ({} bytes)", media_file.display(), upload_size);
                params.media_file = Some(media_file);
            }
            _ => {
                // Skip unknown fields
                while field.next().await.is_some() {}
            }
        }
    }

    Ok(upload_size)
}

/// Extract and process multipart form data for an upload task
///
/// On any error the reserved task directory is removed.
pub async fn extract_upload(
    mut form: Multipart,
    orchestrator: &Orchestrator,
    config: &ServerConfig,
) -> Result<(UploadParams, TaskPaths, usize), HandlerError> {
    let mut params = UploadParams::default();
    let mut paths: Option<TaskPaths> = None;

    match read_fields(&mut form, orchestrator, config, &mut params, &mut paths).await {
        Ok(upload_size) => match paths {
            Some(paths) => Ok((params, paths, upload_size)),
            None => Err(HandlerError::NoMediaFile),
        },
        Err(e) => {
            if let Some(paths) = &paths {
                error!("Discarding upload for task {}: {}", paths.id, e);
            }
            Err(e.with_cleanup(paths.as_ref().map(|p| &p.folder)))
        }
    }
}
