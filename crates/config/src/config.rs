//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but cannot be used
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Library and state locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Directories scanned for media files
    #[serde(default)]
    pub library_roots: Vec<PathBuf>,
    /// Root of the mirrored tree that receives processed originals
    #[serde(default)]
    pub processed_root: Option<PathBuf>,
    /// Directory holding deferred-move sidecar files
    #[serde(default = "default_deferred_dir")]
    pub deferred_dir: PathBuf,
}

fn default_deferred_dir() -> PathBuf {
    PathBuf::from("deferred-moves")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            library_roots: Vec::new(),
            processed_root: None,
            deferred_dir: default_deferred_dir(),
        }
    }
}

/// Encoder invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// ffmpeg video encoder name (libx265, hevc_qsv, hevc_nvenc, ...)
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Rate-control quality value; the flag it is passed with depends on the encoder
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_preset")]
    pub preset: String,
    /// `-hwaccel` value, e.g. `qsv`
    #[serde(default)]
    pub hwaccel: Option<String>,
    /// `-hwaccel_device` value, e.g. `/dev/dri/renderD128`
    #[serde(default)]
    pub hwaccel_device: Option<String>,
    /// `-hwaccel_output_format` value, e.g. `qsv`
    #[serde(default)]
    pub hwaccel_output_format: Option<String>,
    /// Fixed hardware decoder passed as an input-side `-c:v`, e.g. `h264_qsv`
    #[serde(default)]
    pub hw_decoder: Option<String>,
    #[serde(default = "default_copy_codec")]
    pub audio_codec: String,
    #[serde(default = "default_copy_codec")]
    pub subtitle_codec: String,
    /// Output container extension
    #[serde(default = "default_container")]
    pub container: String,
    /// Length of the validation pass in seconds
    #[serde(default = "default_validation_seconds")]
    pub validation_seconds: u32,
    /// Maximum validation retries while degrading hardware acceleration
    #[serde(default = "default_validation_attempts")]
    pub validation_attempts: u32,
    /// Base delay of the exponential backoff between validation retries
    #[serde(default = "default_validation_backoff_ms")]
    pub validation_backoff_ms: u64,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_video_codec() -> String {
    "libx265".to_string()
}

fn default_quality() -> u8 {
    24
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_copy_codec() -> String {
    "copy".to_string()
}

fn default_container() -> String {
    "mkv".to_string()
}

fn default_validation_seconds() -> u32 {
    10
}

fn default_validation_attempts() -> u32 {
    3
}

fn default_validation_backoff_ms() -> u64 {
    1000
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            video_codec: default_video_codec(),
            quality: default_quality(),
            preset: default_preset(),
            hwaccel: None,
            hwaccel_device: None,
            hwaccel_output_format: None,
            hw_decoder: None,
            audio_codec: default_copy_codec(),
            subtitle_codec: default_copy_codec(),
            container: default_container(),
            validation_seconds: default_validation_seconds(),
            validation_attempts: default_validation_attempts(),
            validation_backoff_ms: default_validation_backoff_ms(),
        }
    }
}

/// Kind of library content; movies get an extra absolute-size floor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[default]
    Movie,
    Series,
}

/// Conversion decision settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionConfig {
    /// Requested destination resolution (`1920x1080`, `fhd`, `4k`, ...)
    #[serde(default)]
    pub destination_resolution: Option<String>,
    #[serde(default)]
    pub scale_up: bool,
    #[serde(default = "default_true")]
    pub scale_down: bool,
    #[serde(default = "default_true")]
    pub keep_aspect_ratio: bool,
    #[serde(default)]
    pub force_convert: bool,
    #[serde(default)]
    pub force_resize: bool,
    #[serde(default)]
    pub content_kind: ContentKind,
    /// Codec name (as reported by ffprobe) that counts as already converted
    #[serde(default = "default_target_codec")]
    pub target_codec: String,
}

fn default_true() -> bool {
    true
}

fn default_target_codec() -> String {
    "hevc".to_string()
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            destination_resolution: None,
            scale_up: false,
            scale_down: true,
            keep_aspect_ratio: true,
            force_convert: false,
            force_resize: false,
            content_kind: ContentKind::default(),
            target_codec: default_target_codec(),
        }
    }
}

/// Audio and subtitle language preferences
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguagesConfig {
    /// `all`, `none`, `nomap` or a language code
    #[serde(default = "default_all")]
    pub audio: String,
    /// `all`, `none`, `nomap` or a language code
    #[serde(default = "default_all")]
    pub subtitle: String,
    /// Audio language to mark as the default stream
    #[serde(default)]
    pub default_audio: Option<String>,
    /// Subtitle language to mark as the default stream
    #[serde(default)]
    pub default_subtitle: Option<String>,
}

fn default_all() -> String {
    "all".to_string()
}

impl Default for LanguagesConfig {
    fn default() -> Self {
        Self {
            audio: default_all(),
            subtitle: default_all(),
            default_audio: None,
            default_subtitle: None,
        }
    }
}

/// Post-encode file handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionConfig {
    /// Outputs smaller than this are treated as failed encodes
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    /// Move originals into the processed tree instead of deleting them
    #[serde(default = "default_true")]
    pub move_on_completion: bool,
    /// Stop the whole run on the first failed file
    #[serde(default)]
    pub halt_on_error: bool,
    /// Stem suffix marking an original that must not be converted again
    #[serde(default = "default_processed_marker")]
    pub processed_marker: String,
    /// Stem suffix of the encoder's working output
    #[serde(default = "default_work_suffix")]
    pub work_suffix: String,
    #[serde(default = "default_remove_attempts")]
    pub remove_attempts: u32,
    #[serde(default = "default_long_delay_secs")]
    pub remove_delay_secs: u64,
    #[serde(default = "default_move_attempts")]
    pub move_attempts: u32,
    #[serde(default = "default_long_delay_secs")]
    pub move_delay_secs: u64,
    #[serde(default = "default_rename_attempts")]
    pub rename_attempts: u32,
    #[serde(default = "default_rename_delay_secs")]
    pub rename_delay_secs: u64,
}

fn default_min_output_bytes() -> u64 {
    100 * 1024
}

fn default_processed_marker() -> String {
    "processed".to_string()
}

fn default_work_suffix() -> String {
    "encoding".to_string()
}

fn default_remove_attempts() -> u32 {
    5
}

fn default_move_attempts() -> u32 {
    5
}

fn default_rename_attempts() -> u32 {
    3
}

fn default_long_delay_secs() -> u64 {
    15
}

fn default_rename_delay_secs() -> u64 {
    5
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            min_output_bytes: default_min_output_bytes(),
            move_on_completion: true,
            halt_on_error: false,
            processed_marker: default_processed_marker(),
            work_suffix: default_work_suffix(),
            remove_attempts: default_remove_attempts(),
            remove_delay_secs: default_long_delay_secs(),
            move_attempts: default_move_attempts(),
            move_delay_secs: default_long_delay_secs(),
            rename_attempts: default_rename_attempts(),
            rename_delay_secs: default_rename_delay_secs(),
        }
    }
}

/// Logging settings consumed by the binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; console logging is always on
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Log every encoder line instead of suppressing frame counters
    #[serde(default)]
    pub verbose: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            verbose: false,
        }
    }
}

/// Which media manager receives the refresh command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshKind {
    Radarr,
    Sonarr,
}

/// Title-refresh webhook target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshConfig {
    pub kind: RefreshKind,
    pub url: String,
    pub api_key: String,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub languages: LanguagesConfig,
    #[serde(default)]
    pub transition: TransitionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub refresh: Option<RefreshConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MEDIASHRINK_FORCE_CONVERT -> conversion.force_convert
    /// - MEDIASHRINK_FORCE_RESIZE -> conversion.force_resize
    /// - MEDIASHRINK_DESTINATION_RESOLUTION -> conversion.destination_resolution
    /// - MEDIASHRINK_VIDEO_CODEC -> encode.video_codec
    /// - MEDIASHRINK_QUALITY -> encode.quality
    /// - MEDIASHRINK_HALT_ON_ERROR -> transition.halt_on_error
    /// - MEDIASHRINK_LOG_LEVEL -> logging.level
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("MEDIASHRINK_FORCE_CONVERT") {
            self.conversion.force_convert = v;
        }

        if let Some(v) = env_bool("MEDIASHRINK_FORCE_RESIZE") {
            self.conversion.force_resize = v;
        }

        if let Ok(val) = env::var("MEDIASHRINK_DESTINATION_RESOLUTION") {
            let val = val.trim();
            self.conversion.destination_resolution = if val.is_empty() {
                None
            } else {
                Some(val.to_string())
            };
        }

        if let Ok(val) = env::var("MEDIASHRINK_VIDEO_CODEC") {
            if !val.trim().is_empty() {
                self.encode.video_codec = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("MEDIASHRINK_QUALITY") {
            if let Ok(quality) = val.parse::<u8>() {
                self.encode.quality = quality;
            }
        }

        if let Some(v) = env_bool("MEDIASHRINK_HALT_ON_ERROR") {
            self.transition.halt_on_error = v;
        }

        if let Ok(val) = env::var("MEDIASHRINK_LOG_LEVEL") {
            if !val.trim().is_empty() {
                self.logging.level = val.trim().to_string();
            }
        }
    }

    /// Reject values no run could work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encode.video_codec.trim().is_empty() {
            return Err(ConfigError::Invalid("encode.video_codec is empty".to_string()));
        }
        if self.encode.validation_seconds == 0 {
            return Err(ConfigError::Invalid(
                "encode.validation_seconds must be at least 1".to_string(),
            ));
        }
        let budgets = [
            ("transition.remove_attempts", self.transition.remove_attempts),
            ("transition.move_attempts", self.transition.move_attempts),
            ("transition.rename_attempts", self.transition.rename_attempts),
        ];
        for (name, attempts) in budgets {
            if attempts == 0 {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

/// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn env_bool(name: &str) -> Option<bool> {
    let val = env::var(name).ok()?;
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
