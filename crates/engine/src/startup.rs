//! Startup checks
//!
//! Verifies that ffmpeg and ffprobe can be run before any file is touched.

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("could not parse {tool} version from: {line}")]
    UnknownVersion { tool: String, line: String },
}

/// Versions found by [`run_startup_checks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolVersions {
    pub ffmpeg: u32,
    pub ffprobe: u32,
}

/// Extracts the major version from `<tool> -version` output.
///
/// Handles various version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<u32> {
    let marker = format!("{} version", tool.to_lowercase());
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(&marker))?;

    let version_part = version_line
        .to_lowercase()
        .split(&marker)
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    parse_tool_version(version_output, "ffmpeg")
}

/// Runs `<program> -version` and returns the parsed major version.
pub fn check_tool(program: &Path, tool: &str) -> Result<u32, StartupError> {
    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool: tool.to_string(),
        reason,
    };

    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| unavailable(format!("failed to run {}: {}", program.display(), e)))?;

    if !output.status.success() {
        return Err(unavailable(format!("{} -version exited with {}", program.display(), output.status)));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    parse_tool_version(&version_output, tool).ok_or_else(|| StartupError::UnknownVersion {
        tool: tool.to_string(),
        line: version_output.lines().next().unwrap_or("(empty)").to_string(),
    })
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability and version
/// 2. ffprobe availability and version
pub fn run_startup_checks(cfg: &Config) -> Result<ToolVersions, StartupError> {
    let ffmpeg = check_tool(&cfg.encode.ffmpeg_path, "ffmpeg")?;
    let ffprobe = check_tool(&cfg.encode.ffprobe_path, "ffprobe")?;

    info!(ffmpeg, ffprobe, "Found ffmpeg and ffprobe");
    if let Some(hwaccel) = &cfg.encode.hwaccel {
        info!(hwaccel = %hwaccel, codec = %cfg.encode.video_codec, "Hardware acceleration requested");
    }

    Ok(ToolVersions { ffmpeg, ffprobe })
}
