//! Media probing via ffprobe.
//!
//! Runs ffprobe once per stream kind, hands the block text to the stream
//! parser and resolves the file's duration.

use crate::streams::{parse_streams, StreamKind, StreamRecord};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe exited unsuccessfully.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// None of the duration sources produced a value.
    #[error("could not determine duration of {0}")]
    DurationUnresolved(PathBuf),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the decision step needs to know about one file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_secs: f64,
    pub video: Vec<StreamRecord>,
    pub audio: Vec<StreamRecord>,
    pub subtitle: Vec<StreamRecord>,
}

impl MediaInfo {
    /// First video stream, which is the one that gets encoded.
    pub fn primary_video(&self) -> Option<&StreamRecord> {
        self.video.first()
    }

    /// Duration in whole minutes, rounded up and never below one.
    pub fn minutes(&self) -> u64 {
        ((self.duration_secs / 60.0).ceil() as u64).max(1)
    }

    /// Size in whole megabytes.
    pub fn size_mb(&self) -> u64 {
        self.size_bytes / (1024 * 1024)
    }

    pub fn size_per_minute(&self) -> u64 {
        self.size_mb() / self.minutes()
    }
}

/// Source of [`MediaInfo`]; the pipeline depends on this rather than on ffprobe.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;
}

/// [`MediaProber`] backed by the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }

    /// Returns (stdout, stderr) of one ffprobe run restricted to `kind`.
    async fn run(
        &self,
        path: &Path,
        kind: StreamKind,
        with_format: bool,
    ) -> Result<(String, String), ProbeError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.arg("-hide_banner")
            .args(["-select_streams", kind.specifier(), "-show_streams"]);
        if with_format {
            cmd.arg("-show_format");
        } else {
            cmd.args(["-v", "error"]);
        }
        let output = cmd.arg(path).kill_on_drop(true).output().await?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok((String::from_utf8_lossy(&output.stdout).to_string(), stderr))
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let size_bytes = tokio::fs::metadata(path).await?.len();

        let (video_text, banner) = self.run(path, StreamKind::Video, true).await?;
        let (audio_text, _) = self.run(path, StreamKind::Audio, false).await?;
        let (subtitle_text, _) = self.run(path, StreamKind::Subtitle, false).await?;

        let video = parse_streams(&video_text, StreamKind::Video);
        let duration_secs = resolve_duration(&video, &video_text, &banner)
            .ok_or_else(|| ProbeError::DurationUnresolved(path.to_path_buf()))?;

        Ok(MediaInfo {
            path: path.to_path_buf(),
            size_bytes,
            duration_secs,
            video,
            audio: parse_streams(&audio_text, StreamKind::Audio),
            subtitle: parse_streams(&subtitle_text, StreamKind::Subtitle),
        })
    }
}

/// Works out a duration from, in order: the video stream's `duration`
/// or `DURATION` tag, the `[FORMAT]` block, then a `Duration:` line in the
/// human-readable dump.
pub fn resolve_duration(video: &[StreamRecord], format_text: &str, raw_text: &str) -> Option<f64> {
    stream_duration(video)
        .or_else(|| format_duration(format_text))
        .or_else(|| banner_duration(raw_text))
}

fn stream_duration(video: &[StreamRecord]) -> Option<f64> {
    let stream = video.first()?;
    stream.duration_secs().or_else(|| {
        stream
            .fields()
            .find(|(k, _)| k.starts_with("DURATION"))
            .and_then(|(_, v)| parse_clock(v))
            .filter(|d| *d > 0.0)
    })
}

/// `duration=` inside a `[FORMAT]...[/FORMAT]` block.
pub fn format_duration(text: &str) -> Option<f64> {
    let mut inside = false;
    for line in text.lines().map(str::trim) {
        if line.eq_ignore_ascii_case("[format]") {
            inside = true;
        } else if line.eq_ignore_ascii_case("[/format]") {
            inside = false;
        } else if inside {
            if let Some(value) = line.strip_prefix("duration=") {
                return value.trim().parse::<f64>().ok().filter(|d| *d > 0.0);
            }
        }
    }
    None
}

fn banner_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").ok())
        .as_ref()
}

fn banner_duration(text: &str) -> Option<f64> {
    let caps = banner_regex()?.captures(text)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds).filter(|d| *d > 0.0)
}

/// Parses `HH:MM:SS[.fraction]` into seconds.
pub fn parse_clock(s: &str) -> Option<f64> {
    let mut parts = s.trim().splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_with(lines: &str) -> Vec<StreamRecord> {
        parse_streams(&format!("[STREAM]\n{}\n[/STREAM]\n", lines), StreamKind::Video)
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("00:00:10.500"), Some(10.5));
        assert_eq!(parse_clock("01:02:03"), Some(3723.0));
        assert_eq!(parse_clock("garbage"), None);
        assert_eq!(parse_clock("10:00"), None);
    }

    #[test]
    fn test_duration_prefers_stream_value() {
        let video = video_with("index=0\nduration=120.5");
        let format = "[FORMAT]\nduration=999.0\n[/FORMAT]\n";
        assert_eq!(resolve_duration(&video, format, ""), Some(120.5));
    }

    #[test]
    fn test_duration_falls_back_to_tag() {
        // Matroska stores duration only as a tag
        let video = video_with("index=0\nduration=N/A\nTAG:DURATION=00:42:00.000000000");
        assert_eq!(resolve_duration(&video, "", ""), Some(2520.0));
    }

    #[test]
    fn test_duration_falls_back_to_format_block() {
        let video = video_with("index=0\ncodec_name=h264");
        let format = "[STREAM]\nindex=0\n[/STREAM]\n[FORMAT]\nfilename=a.mkv\nduration=600.000000\n[/FORMAT]\n";
        assert_eq!(resolve_duration(&video, format, ""), Some(600.0));
    }

    #[test]
    fn test_duration_falls_back_to_banner() {
        let banner = "Input #0, matroska,webm, from 'a.mkv':\n  Duration: 01:30:00.25, start: 0.000000, bitrate: 8000 kb/s\n";
        assert_eq!(resolve_duration(&[], "", banner), Some(5400.25));
    }

    #[test]
    fn test_duration_unresolved() {
        let banner = "  Duration: N/A, bitrate: N/A\n";
        assert_eq!(resolve_duration(&[], "[FORMAT]\nduration=N/A\n[/FORMAT]", banner), None);
    }

    #[test]
    fn test_size_per_minute_rounds_minutes_up() {
        let info = MediaInfo {
            path: PathBuf::from("a.mkv"),
            size_bytes: 100 * 1024 * 1024,
            duration_secs: 541.0,
            video: vec![],
            audio: vec![],
            subtitle: vec![],
        };
        assert_eq!(info.minutes(), 10);
        assert_eq!(info.size_per_minute(), 10);
    }

    #[test]
    fn test_minutes_never_zero() {
        let info = MediaInfo {
            path: PathBuf::from("a.mkv"),
            size_bytes: 5 * 1024 * 1024,
            duration_secs: 0.2,
            video: vec![],
            audio: vec![],
            subtitle: vec![],
        };
        assert_eq!(info.minutes(), 1);
        assert_eq!(info.size_per_minute(), 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ffprobe_prober_with_fake_binary() {
        use crate::test_support::{write_script, write_sized};

        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "ffprobe",
            r#"case "$*" in
  *"-select_streams v"*) printf '[STREAM]\nindex=0\ncodec_name=h264\nwidth=1920\nheight=1080\n[/STREAM]\n[FORMAT]\nduration=600.0\n[/FORMAT]\n' ;;
  *"-select_streams a"*) printf '[STREAM]\nindex=1\ncodec_name=aac\nTAG:language=eng\n[/STREAM]\n' ;;
  *) ;;
esac
exit 0"#,
        );
        let media = dir.path().join("movie.mkv");
        write_sized(&media, 4096);

        let info = FfprobeProber::new(script).probe(&media).await.unwrap();
        assert_eq!(info.size_bytes, 4096);
        assert_eq!(info.duration_secs, 600.0);
        assert_eq!(info.video.len(), 1);
        assert_eq!(info.primary_video().and_then(|v| v.width()), Some(1920));
        assert_eq!(info.audio[0].language(), Some("eng"));
        assert!(info.subtitle.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ffprobe_failure_is_reported() {
        use crate::test_support::{write_script, write_sized};

        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ffprobe", "echo 'moov atom not found' >&2\nexit 1");
        let media = dir.path().join("broken.mp4");
        write_sized(&media, 10);

        let err = FfprobeProber::new(script).probe(&media).await.unwrap_err();
        assert!(matches!(err, ProbeError::FfprobeFailed(ref msg) if msg.contains("moov atom")));
    }
}
