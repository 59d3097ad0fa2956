//! ffmpeg argument construction.
//!
//! [`EncoderArgs`] keeps input-side and output-side options apart so the
//! hardware fallback ladder can strip decoder flags without disturbing
//! anything else.

use crate::config::EncodeConfig;
use crate::decision::{EncodePlan, StreamSelection};
use crate::streams::StreamKind;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

/// Options placed before every invocation.
const GLOBAL_OPTIONS: &[&str] = &["-hide_banner", "-nostdin", "-y"];

/// Argument set for one ffmpeg run.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderArgs {
    input_options: Vec<String>,
    input: PathBuf,
    output_options: Vec<String>,
    output: PathBuf,
}

impl EncoderArgs {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input_options: Vec::new(),
            input: input.into(),
            output_options: Vec::new(),
            output: output.into(),
        }
    }

    pub fn input_option(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.input_options.push(flag.to_string());
        self.input_options.push(value.into());
        self
    }

    pub fn output_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_options.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn input_options(&self) -> &[String] {
        &self.input_options
    }

    pub fn output_options(&self) -> &[String] {
        &self.output_options
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn has_input_option(&self, flag: &str) -> bool {
        self.input_options.iter().any(|a| a == flag)
    }

    /// Removes every occurrence of `flag` and the value after it from the
    /// input options. Remaining arguments keep their order.
    pub fn remove_input_option(&mut self, flag: &str) -> bool {
        let mut removed = false;
        let mut kept = Vec::with_capacity(self.input_options.len());
        let mut iter = std::mem::take(&mut self.input_options).into_iter();
        while let Some(arg) = iter.next() {
            if arg == flag {
                iter.next();
                removed = true;
            } else {
                kept.push(arg);
            }
        }
        self.input_options = kept;
        removed
    }

    /// Full argument list for the real encode.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = GLOBAL_OPTIONS.iter().map(OsString::from).collect();
        args.extend(self.input_options.iter().map(OsString::from));
        args.push("-i".into());
        args.push(self.input.clone().into_os_string());
        args.extend(self.output_options.iter().map(OsString::from));
        args.push(self.output.clone().into_os_string());
        args
    }

    /// Bounded test encode of the first `seconds` written to the null muxer.
    pub fn validation_args(&self, seconds: u32) -> Vec<OsString> {
        let mut args: Vec<OsString> = GLOBAL_OPTIONS.iter().map(OsString::from).collect();
        args.extend(self.input_options.iter().map(OsString::from));
        args.push("-i".into());
        args.push(self.input.clone().into_os_string());
        args.push("-t".into());
        args.push(seconds.to_string().into());
        args.extend(self.output_options.iter().map(OsString::from));
        args.extend(["-f", "null", "-"].map(OsString::from));
        args
    }
}

/// Rate-control flag understood by the given encoder.
pub fn quality_flag(video_codec: &str) -> &'static str {
    let codec = video_codec.to_ascii_lowercase();
    if codec.contains("qsv") {
        "-global_quality"
    } else if codec.contains("nvenc") {
        "-cq"
    } else if codec.contains("vaapi") {
        "-qp"
    } else {
        "-crf"
    }
}

fn ten_bit_pix_fmt(video_codec: &str) -> &'static str {
    let codec = video_codec.to_ascii_lowercase();
    if codec.contains("qsv") || codec.contains("vaapi") {
        "p010le"
    } else {
        "yuv420p10le"
    }
}

/// Builds the ffmpeg arguments for `plan` using the configured encoder.
pub fn build_encoder_args(plan: &EncodePlan, cfg: &EncodeConfig) -> EncoderArgs {
    let mut args = EncoderArgs::new(&plan.input, &plan.output);

    if let Some(hwaccel) = &cfg.hwaccel {
        args.input_option("-hwaccel", hwaccel.as_str());
    }
    if let Some(device) = &cfg.hwaccel_device {
        args.input_option("-hwaccel_device", device.as_str());
    }
    if let Some(format) = &cfg.hwaccel_output_format {
        args.input_option("-hwaccel_output_format", format.as_str());
    }
    if let Some(decoder) = &cfg.hw_decoder {
        args.input_option("-c:v", decoder.as_str());
    }

    args.output_args(["-map", "0:v:0"]);
    args.output_args(plan.audio.map_args(StreamKind::Audio));
    args.output_args(plan.subtitle.map_args(StreamKind::Subtitle));

    if let Some(target) = plan.resize.target() {
        args.output_args(["-vf".to_string(), target.filter()]);
    }

    args.output_args(["-c:v", cfg.video_codec.as_str()]);
    args.output_args([
        quality_flag(&cfg.video_codec).to_string(),
        cfg.quality.to_string(),
    ]);
    if !cfg.preset.is_empty() {
        args.output_args(["-preset", cfg.preset.as_str()]);
    }
    if plan.ten_bit {
        args.output_args(["-pix_fmt", ten_bit_pix_fmt(&cfg.video_codec)]);
    }
    if let Some(hdr) = &plan.hdr {
        args.output_args(hdr.to_args());
    }

    if plan.audio != StreamSelection::None {
        args.output_args(["-c:a", cfg.audio_codec.as_str()]);
    }
    if plan.subtitle != StreamSelection::None {
        args.output_args(["-c:s", cfg.subtitle_codec.as_str()]);
    }
    args.output_args(plan.dispositions.iter().cloned());

    args
}

/// One rung of the hardware fallback ladder, applied cumulatively in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackLevel {
    /// Drop the fixed hardware decoder (`-c:v` before the input).
    DropDecoder,
    /// Drop `-hwaccel_output_format`.
    DropOutputFormat,
    /// Drop `-hwaccel` and `-hwaccel_device`.
    DropAcceleration,
}

impl FallbackLevel {
    pub const LADDER: [FallbackLevel; 3] = [
        FallbackLevel::DropDecoder,
        FallbackLevel::DropOutputFormat,
        FallbackLevel::DropAcceleration,
    ];

    /// Applies this level; false when the arguments did not change.
    pub fn apply(&self, args: &mut EncoderArgs) -> bool {
        match self {
            FallbackLevel::DropDecoder => args.remove_input_option("-c:v"),
            FallbackLevel::DropOutputFormat => args.remove_input_option("-hwaccel_output_format"),
            FallbackLevel::DropAcceleration => {
                let accel = args.remove_input_option("-hwaccel");
                let device = args.remove_input_option("-hwaccel_device");
                accel || device
            }
        }
    }
}

impl fmt::Display for FallbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FallbackLevel::DropDecoder => "without hardware decoder",
            FallbackLevel::DropOutputFormat => "without hardware output format",
            FallbackLevel::DropAcceleration => "without hardware acceleration",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{HdrTags, ResizePlan, ScaleTarget};
    use crate::resolution::ResolutionTier;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().to_string()).collect()
    }

    fn plan() -> EncodePlan {
        EncodePlan {
            input: PathBuf::from("/lib/a.mkv"),
            output: PathBuf::from("/lib/a.encoding.mkv"),
            duration_secs: 600.0,
            source_tier: ResolutionTier::Fhd,
            resize: ResizePlan::NotRequested,
            hdr: None,
            ten_bit: false,
            audio: StreamSelection::All,
            subtitle: StreamSelection::All,
            dispositions: vec![],
        }
    }

    fn qsv_config() -> EncodeConfig {
        EncodeConfig {
            video_codec: "hevc_qsv".to_string(),
            hwaccel: Some("qsv".to_string()),
            hwaccel_output_format: Some("qsv".to_string()),
            hw_decoder: Some("h264_qsv".to_string()),
            ..EncodeConfig::default()
        }
    }

    #[test]
    fn test_software_args_layout() {
        let args = build_encoder_args(&plan(), &EncodeConfig::default());
        assert_eq!(
            strings(&args.to_args()),
            vec![
                "-hide_banner", "-nostdin", "-y",
                "-i", "/lib/a.mkv",
                "-map", "0:v:0", "-map", "0:a?", "-map", "0:s?",
                "-c:v", "libx265", "-crf", "24", "-preset", "medium",
                "-c:a", "copy", "-c:s", "copy",
                "/lib/a.encoding.mkv",
            ]
        );
    }

    #[test]
    fn test_plan_features_reach_output_options() {
        let mut plan = plan();
        plan.resize = ResizePlan::Scale(ScaleTarget { width: 1920, height: 800 });
        plan.ten_bit = true;
        plan.hdr = Some(HdrTags {
            primaries: "bt2020".to_string(),
            transfer: "smpte2084".to_string(),
            colorspace: "bt2020nc".to_string(),
        });
        plan.audio = StreamSelection::Language("eng".to_string());
        plan.subtitle = StreamSelection::None;
        plan.dispositions = vec!["-disposition:a:0".to_string(), "default".to_string()];

        let args = build_encoder_args(&plan, &qsv_config());
        let out = args.output_options().join(" ");
        assert!(out.contains("-map 0:a:m:language:eng"));
        assert!(!out.contains("0:s"));
        assert!(!out.contains("-c:s"));
        assert!(out.contains("-vf scale=1920:800"));
        assert!(out.contains("-global_quality 24"));
        assert!(out.contains("-pix_fmt p010le"));
        assert!(out.contains("-color_primaries bt2020 -color_trc smpte2084 -colorspace bt2020nc"));
        assert!(out.ends_with("-disposition:a:0 default"));
    }

    #[test]
    fn test_hardware_options_go_before_input() {
        let args = build_encoder_args(&plan(), &qsv_config());
        assert_eq!(
            args.input_options(),
            ["-hwaccel", "qsv", "-hwaccel_output_format", "qsv", "-c:v", "h264_qsv"]
        );
        let flat = strings(&args.to_args());
        let input_pos = flat.iter().position(|a| a == "-i").unwrap();
        let decoder_pos = flat.iter().position(|a| a == "h264_qsv").unwrap();
        assert!(decoder_pos < input_pos);
    }

    #[test]
    fn test_remove_input_option_keeps_order() {
        let mut args = build_encoder_args(&plan(), &qsv_config());
        assert!(args.remove_input_option("-hwaccel_output_format"));
        assert_eq!(args.input_options(), ["-hwaccel", "qsv", "-c:v", "h264_qsv"]);
        assert!(!args.remove_input_option("-hwaccel_output_format"));
        // Output-side -c:v is untouched
        assert!(args.output_options().iter().any(|a| a == "hevc_qsv"));
    }

    #[test]
    fn test_validation_args_bounded_and_null_sink() {
        let args = build_encoder_args(&plan(), &EncodeConfig::default());
        let flat = strings(&args.validation_args(10));
        let i = flat.iter().position(|a| a == "-i").unwrap();
        assert_eq!(&flat[i + 2..i + 4], ["-t", "10"]);
        assert_eq!(&flat[flat.len() - 3..], ["-f", "null", "-"]);
        assert!(!flat.iter().any(|a| a.ends_with("a.encoding.mkv")));
    }

    #[test]
    fn test_fallback_ladder_strips_in_order() {
        let mut args = build_encoder_args(&plan(), &qsv_config());

        assert!(FallbackLevel::DropDecoder.apply(&mut args));
        assert_eq!(args.input_options(), ["-hwaccel", "qsv", "-hwaccel_output_format", "qsv"]);

        assert!(FallbackLevel::DropOutputFormat.apply(&mut args));
        assert_eq!(args.input_options(), ["-hwaccel", "qsv"]);

        assert!(FallbackLevel::DropAcceleration.apply(&mut args));
        assert!(args.input_options().is_empty());
    }

    #[test]
    fn test_fallback_level_without_effect_reports_no_change() {
        let mut args = build_encoder_args(&plan(), &EncodeConfig::default());
        for level in FallbackLevel::LADDER {
            assert!(!level.apply(&mut args));
        }
    }

    #[test]
    fn test_quality_flag_by_encoder() {
        assert_eq!(quality_flag("hevc_qsv"), "-global_quality");
        assert_eq!(quality_flag("hevc_nvenc"), "-cq");
        assert_eq!(quality_flag("hevc_vaapi"), "-qp");
        assert_eq!(quality_flag("libx265"), "-crf");
    }
}
