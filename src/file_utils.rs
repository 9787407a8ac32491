// File utilities for the subtitle API
//
// Task working directories: creating them and removing what a task no longer needs.

use log::{debug, error, info};
use std::fs;
use std::io;
use std::path::Path;
use uuid::Uuid;

use crate::config::TaskPaths;

/// Generate a task id and create its working directory under `base_dir`
///
/// # Errors
///
/// Returns an IO error if directory creation fails
pub fn generate_unique_task_paths(base_dir: &Path) -> io::Result<TaskPaths> {
    let id = Uuid::new_v4().to_string();
    let folder = base_dir.join(&id);
    fs::create_dir_all(&folder)?;
    Ok(TaskPaths { id, folder })
}

/// Clean up a folder and its contents
///
/// This function logs errors but doesn't return them to the caller
pub fn cleanup_folder(folder_path: &Path) {
    if !folder_path.exists() {
        return;
    }
    if let Err(e) = fs::remove_dir_all(folder_path) {
        error!("Failed to clean up folder {}: {}", folder_path.display(), e);
    } else {
        info!("Successfully cleaned up folder: {}", folder_path.display());
    }
}

/// Remove every entry of `dir` except the paths in `keep`. Errors are logged, not returned.
pub fn remove_dir_contents_except(dir: &Path, keep: &[&Path]) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                error!("Failed to list {}: {}", dir.display(), e);
            }
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if keep.iter().any(|k| *k == path) {
            continue;
        }
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) => error!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

/// Remove a single file if present
pub fn remove_file_if_exists(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            error!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
