//! Helpers shared by unit tests that stand in shell scripts for ffmpeg/ffprobe.

use std::fs;
use std::path::{Path, PathBuf};

/// Writes an executable `/bin/sh` script and returns its path.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Creates a (sparse) file of exactly `len` bytes.
pub fn write_sized(path: &Path, len: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::File::create(path).unwrap().set_len(len).unwrap();
}
