//! Workspace file listing.
//!
//! After (and during) a run the workbench shows which files the agent left
//! in the session's working directory. The walk skips the shared-store
//! links and tool litter so only genuine run artifacts show up.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Directory names never descended into. `data` and `save_folder` are the
/// links back into the shared store; the rest is notebook and VCS litter.
pub const EXCLUDED_DIRS: &[&str] = &[
    "data",
    "save_folder",
    ".git",
    "__pycache__",
    ".ipynb_checkpoints",
    "node_modules",
];

/// One regular file found in a session workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct GeneratedFile {
    pub name: String,
    pub relative_path: String,
    pub absolute_path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub max_depth: usize,
    pub max_files: usize,
}

/// Lists regular files under `session_dir`, sorted by relative path.
///
/// Dot entries and symlinks are skipped entirely, excluded directories are
/// not entered, and the walk stops once `max_files` entries are collected.
/// A missing directory yields an empty listing rather than an error.
pub fn scan_session_files(session_dir: &Path, limits: ScanLimits) -> Vec<GeneratedFile> {
    let mut files = Vec::new();
    if !session_dir.is_dir() {
        return files;
    }

    let mut queue = VecDeque::new();
    queue.push_back((session_dir.to_path_buf(), 0usize));
    let mut truncated = false;

    'walk: while let Some((dir, depth)) = queue.pop_front() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(dir = %dir.display(), error = %err, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                if EXCLUDED_DIRS.contains(&name.as_str()) {
                    continue;
                }
                if depth + 1 <= limits.max_depth {
                    queue.push_back((entry.path(), depth + 1));
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            if files.len() >= limits.max_files {
                truncated = true;
                break 'walk;
            }
            let path = entry.path();
            let size_bytes = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            let relative = path.strip_prefix(session_dir).unwrap_or(&path);
            files.push(GeneratedFile {
                name,
                relative_path: normalize_path(relative),
                absolute_path: normalize_path(&path),
                size_bytes,
            });
        }
    }

    if truncated {
        tracing::warn!(limit = limits.max_files, dir = %session_dir.display(), "file listing truncated");
    }
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    files
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
