//! Scanner module for discovering video files in library directories.
//!
//! Walks each configured library root and returns the files that are still
//! candidates for conversion, in path order.

use crate::config::Config;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Video file extensions supported by the scanner (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "m4v", "ts", "m2ts", "wmv", "webm", "mpg", "mpeg", "flv",
];

/// A candidate video file discovered during library scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCandidate {
    /// Full path to the video file.
    pub path: PathBuf,
    /// Library root the file was found under.
    pub library_root: PathBuf,
    /// File size in bytes at discovery time.
    pub size_bytes: u64,
}

/// Which files and directories a scan leaves out.
#[derive(Debug, Clone, Default)]
pub struct ScanRules {
    /// Stem suffix of originals already handled.
    pub processed_marker: String,
    /// Stem suffix of encoder working files.
    pub work_suffix: String,
    /// Directory trees never descended into.
    pub excluded_dirs: Vec<PathBuf>,
}

impl ScanRules {
    pub fn from_config(config: &Config) -> Self {
        Self {
            processed_marker: config.transition.processed_marker.clone(),
            work_suffix: config.transition.work_suffix.clone(),
            excluded_dirs: config.paths.processed_root.iter().cloned().collect(),
        }
    }

    /// True if the file's stem ends in the processed marker or work suffix,
    /// as in `film.processed.mkv`.
    pub fn is_marked(&self, path: &Path) -> bool {
        let inner = path
            .file_stem()
            .map(Path::new)
            .and_then(Path::extension)
            .and_then(OsStr::to_str);
        match inner {
            Some(tag) => tag == self.processed_marker || tag == self.work_suffix,
            None => false,
        }
    }

    fn is_excluded_dir(&self, path: &Path) -> bool {
        self.excluded_dirs.iter().any(|dir| path.starts_with(dir))
    }
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = ext.to_lowercase();
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Scans the given library roots for video files.
///
/// Hidden directories and excluded trees are skipped, as are files whose
/// stem carries the processed marker or the work suffix. Missing roots are
/// ignored.
pub fn scan_libraries(roots: &[PathBuf], rules: &ScanRules) -> Vec<ScanCandidate> {
    let mut candidates = Vec::new();

    for root in roots {
        if !root.exists() {
            warn!(root = %root.display(), "Library root does not exist");
            continue;
        }

        // A single file is its own library, rooted at its directory
        if root.is_file() {
            if is_video_file(root) && !rules.is_marked(root) {
                if let Ok(metadata) = root.metadata() {
                    candidates.push(ScanCandidate {
                        path: root.clone(),
                        library_root: root.parent().map(Path::to_path_buf).unwrap_or_default(),
                        size_bytes: metadata.len(),
                    });
                }
            }
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let hidden = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with('.'));
            !hidden && !rules.is_excluded_dir(entry.path())
        });

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() || !is_video_file(path) || rules.is_marked(path) {
                continue;
            }

            if let Ok(metadata) = entry.metadata() {
                candidates.push(ScanCandidate {
                    path: path.to_path_buf(),
                    library_root: root.clone(),
                    size_bytes: metadata.len(),
                });
            }
        }
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates
}
