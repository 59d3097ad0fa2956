//! Per-file conversion decisions.
//!
//! Given probed metadata and the configured preferences, decides whether a
//! file is worth encoding and, if so, produces an [`EncodePlan`]: resize
//! geometry, HDR colour tags and audio/subtitle stream selection.

use crate::config::{Config, ContentKind};
use crate::probe::MediaInfo;
use crate::resolution::{
    movie_floor_blocks, size_per_minute_threshold, Dimensions, InvalidResolution, ResolutionTier,
};
use crate::streams::{StreamKind, StreamRecord};
use std::fmt;
use std::path::{Path, PathBuf};

/// Preferences the decision step reads, resolved from [`Config`] once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOptions {
    pub destination: Option<Dimensions>,
    pub scale_up: bool,
    pub scale_down: bool,
    pub keep_aspect_ratio: bool,
    pub force_convert: bool,
    pub force_resize: bool,
    pub content_kind: ContentKind,
    /// ffprobe codec name that counts as already converted.
    pub target_codec: String,
    pub audio_language: String,
    pub subtitle_language: String,
    pub default_audio: Option<String>,
    pub default_subtitle: Option<String>,
}

impl DecisionOptions {
    pub fn from_config(config: &Config) -> Result<Self, InvalidResolution> {
        let destination = config
            .conversion
            .destination_resolution
            .as_deref()
            .map(str::parse::<Dimensions>)
            .transpose()?;
        Ok(Self::with_destination(config, destination))
    }

    fn with_destination(config: &Config, destination: Option<Dimensions>) -> Self {
        Self {
            destination,
            scale_up: config.conversion.scale_up,
            scale_down: config.conversion.scale_down,
            keep_aspect_ratio: config.conversion.keep_aspect_ratio,
            force_convert: config.conversion.force_convert,
            force_resize: config.conversion.force_resize,
            content_kind: config.conversion.content_kind,
            target_codec: config.conversion.target_codec.clone(),
            audio_language: config.languages.audio.clone(),
            subtitle_language: config.languages.subtitle.clone(),
            default_audio: config.languages.default_audio.clone(),
            default_subtitle: config.languages.default_subtitle.clone(),
        }
    }
}

impl Default for DecisionOptions {
    fn default() -> Self {
        Self::with_destination(&Config::default(), None)
    }
}

/// Why a file is left alone this run.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoVideoStream,
    BelowSizePerMinute {
        tier: ResolutionTier,
        rate: u64,
        threshold: u64,
    },
    BelowMovieFloor {
        tier: ResolutionTier,
        size_bytes: u64,
        floor_gib: f64,
    },
    AlreadyTargetCodec(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoVideoStream => write!(f, "no video stream"),
            SkipReason::BelowSizePerMinute {
                tier,
                rate,
                threshold,
            } => write!(
                f,
                "{} MB/min is below the {} threshold of {} MB/min",
                rate, tier, threshold
            ),
            SkipReason::BelowMovieFloor {
                tier,
                size_bytes,
                floor_gib,
            } => write!(
                f,
                "{:.2} GB movie is below the {} floor of {} GB",
                *size_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
                tier,
                floor_gib
            ),
            SkipReason::AlreadyTargetCodec(codec) => write!(f, "already {}", codec),
        }
    }
}

/// Target frame size for the `scale` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleTarget {
    pub width: u32,
    pub height: u32,
}

impl ScaleTarget {
    pub fn filter(&self) -> String {
        format!("scale={}:{}", self.width, self.height)
    }
}

/// Outcome of the resize step.
#[derive(Debug, Clone, PartialEq)]
pub enum ResizePlan {
    /// No usable destination, or the source tier is unknown.
    NotRequested,
    /// A destination was given but resizing was not needed or not allowed.
    Unchanged(String),
    /// Aspect ratios point different ways and stretching was not forced.
    Refused(String),
    Scale(ScaleTarget),
}

impl ResizePlan {
    pub fn target(&self) -> Option<ScaleTarget> {
        match self {
            ResizePlan::Scale(target) => Some(*target),
            _ => None,
        }
    }
}

/// Colour metadata carried through to the output of an HDR source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdrTags {
    pub primaries: String,
    pub transfer: String,
    pub colorspace: String,
}

impl HdrTags {
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "-color_primaries".to_string(),
            self.primaries.clone(),
            "-color_trc".to_string(),
            self.transfer.clone(),
            "-colorspace".to_string(),
            self.colorspace.clone(),
        ]
    }
}

/// Which streams of one kind get mapped into the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSelection {
    All,
    Language(String),
    None,
}

impl StreamSelection {
    /// `-map` arguments for this selection.
    pub fn map_args(&self, kind: StreamKind) -> Vec<String> {
        let selector = kind.specifier();
        match self {
            StreamSelection::All => vec!["-map".to_string(), format!("0:{}?", selector)],
            StreamSelection::Language(lang) => {
                vec!["-map".to_string(), format!("0:{}:m:language:{}", selector, lang)]
            }
            StreamSelection::None => Vec::new(),
        }
    }

    /// Streams that end up in the output, in output order.
    pub fn mapped<'a>(&self, streams: &'a [StreamRecord]) -> Vec<&'a StreamRecord> {
        match self {
            StreamSelection::All => streams.iter().collect(),
            StreamSelection::Language(lang) => streams
                .iter()
                .filter(|s| language_matches(s, lang))
                .collect(),
            StreamSelection::None => Vec::new(),
        }
    }
}

/// Everything needed to run the encoder for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodePlan {
    pub input: PathBuf,
    pub output: PathBuf,
    pub duration_secs: f64,
    pub source_tier: ResolutionTier,
    pub resize: ResizePlan,
    pub hdr: Option<HdrTags>,
    pub ten_bit: bool,
    pub audio: StreamSelection,
    pub subtitle: StreamSelection,
    /// `-disposition` overrides marking preferred-language streams as default.
    pub dispositions: Vec<String>,
}

impl EncodePlan {
    pub fn resized(&self) -> bool {
        matches!(self.resize, ResizePlan::Scale(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip(SkipReason),
    Encode(Box<EncodePlan>),
}

/// Decides what to do with one probed file whose encode will be written to `output`.
pub fn decide(info: &MediaInfo, opts: &DecisionOptions, output: &Path) -> Decision {
    let Some(video) = info.primary_video() else {
        return Decision::Skip(SkipReason::NoVideoStream);
    };

    let source = Dimensions::new(video.width().unwrap_or(0), video.height().unwrap_or(0));
    let tier = source.tier();

    if !opts.force_convert {
        if let Some(reason) = size_gate(info, tier, opts.content_kind) {
            return Decision::Skip(reason);
        }
    }

    let resize = plan_resize(source, opts.destination, opts);

    let codec = video.codec_name().unwrap_or_default();
    if codec.eq_ignore_ascii_case(&opts.target_codec)
        && !opts.force_convert
        && resize.target().is_none()
    {
        return Decision::Skip(SkipReason::AlreadyTargetCodec(codec.to_string()));
    }

    let audio = select_streams(&opts.audio_language, &info.audio);
    let subtitle = select_streams(&opts.subtitle_language, &info.subtitle);

    let mut dispositions = Vec::new();
    if let Some(lang) = opts.default_audio.as_deref() {
        dispositions.extend(default_disposition_args(
            StreamKind::Audio,
            lang,
            &audio.mapped(&info.audio),
        ));
    }
    if let Some(lang) = opts.default_subtitle.as_deref() {
        dispositions.extend(default_disposition_args(
            StreamKind::Subtitle,
            lang,
            &subtitle.mapped(&info.subtitle),
        ));
    }

    Decision::Encode(Box::new(EncodePlan {
        input: info.path.clone(),
        output: output.to_path_buf(),
        duration_secs: info.duration_secs,
        source_tier: tier,
        resize,
        hdr: hdr_tags(video),
        ten_bit: is_ten_bit(video),
        audio,
        subtitle,
        dispositions,
    }))
}

/// Size-per-minute threshold, then the movie floors.
fn size_gate(info: &MediaInfo, tier: ResolutionTier, kind: ContentKind) -> Option<SkipReason> {
    let rate = info.size_per_minute();
    let threshold = size_per_minute_threshold(tier);
    if rate < threshold {
        return Some(SkipReason::BelowSizePerMinute {
            tier,
            rate,
            threshold,
        });
    }

    if kind == ContentKind::Movie {
        if let Some(floor_gib) = movie_floor_blocks(tier, info.size_bytes) {
            return Some(SkipReason::BelowMovieFloor {
                tier,
                size_bytes: info.size_bytes,
                floor_gib,
            });
        }
    }
    None
}

/// Works out whether and how to scale `source` toward `destination`.
pub fn plan_resize(
    source: Dimensions,
    destination: Option<Dimensions>,
    opts: &DecisionOptions,
) -> ResizePlan {
    let Some(dest) = destination else {
        return ResizePlan::NotRequested;
    };
    let (src_tier, dst_tier) = (source.tier(), dest.tier());
    if src_tier == ResolutionTier::Unknown || dst_tier == ResolutionTier::Unknown {
        return ResizePlan::NotRequested;
    }

    let forced = opts.force_convert || opts.force_resize;
    if !forced {
        if src_tier == dst_tier {
            return ResizePlan::Unchanged(format!("source is already {}", src_tier));
        }
        if !opts.scale_up && dest.area() >= source.area() {
            return ResizePlan::Unchanged(format!(
                "scaling up from {} to {} is disabled",
                source, dest
            ));
        }
        if !opts.scale_down && dest.area() <= source.area() {
            return ResizePlan::Unchanged(format!(
                "scaling down from {} to {} is disabled",
                source, dest
            ));
        }
    }

    let (src_ar, dst_ar) = (source.aspect_ratio(), dest.aspect_ratio());
    let portrait_mismatch = (src_ar <= 1.0) != (dst_ar <= 1.0);
    if portrait_mismatch {
        if !opts.force_resize {
            return ResizePlan::Refused(format!(
                "aspect ratio of {} does not fit {}",
                source, dest
            ));
        }
        return ResizePlan::Scale(ScaleTarget {
            width: dest.width,
            height: dest.height,
        });
    }

    if !opts.keep_aspect_ratio {
        return ResizePlan::Scale(ScaleTarget {
            width: dest.width,
            height: dest.height,
        });
    }

    let target = if dst_ar > src_ar {
        ScaleTarget {
            width: round_even(dest.height as f64 * src_ar),
            height: round_even(dest.height as f64),
        }
    } else {
        ScaleTarget {
            width: round_even(dest.width as f64),
            height: round_even(dest.width as f64 / src_ar),
        }
    };
    ResizePlan::Scale(target)
}

/// Encoders want even dimensions for 4:2:0 chroma.
fn round_even(value: f64) -> u32 {
    (((value / 2.0).round() as u32) * 2).max(2)
}

/// 10-bit if any of profile, raw sample depth or pixel format says so.
pub fn is_ten_bit(video: &StreamRecord) -> bool {
    video.profile().is_some_and(|p| p.contains("10"))
        || video.bits_per_raw_sample() == Some("10")
        || video.pix_fmt().is_some_and(|p| p.contains("10"))
}

const HDR_TRANSFERS: &[&str] = &["pq", "hlg", "smpte2084"];

/// Colour tags to carry over, present only when all HDR conditions hold.
pub fn hdr_tags(video: &StreamRecord) -> Option<HdrTags> {
    if !is_ten_bit(video) {
        return None;
    }
    let primaries = video.color_primaries()?;
    let transfer = video.color_transfer()?;
    let colorspace = video.color_space()?;

    let bt2020 = |s: &str| s.to_ascii_lowercase().starts_with("bt2020");
    if !bt2020(primaries)
        || !bt2020(colorspace)
        || !HDR_TRANSFERS.contains(&transfer.to_ascii_lowercase().as_str())
    {
        return None;
    }

    Some(HdrTags {
        primaries: primaries.to_string(),
        transfer: transfer.to_string(),
        colorspace: colorspace.to_string(),
    })
}

fn language_matches(stream: &StreamRecord, lang: &str) -> bool {
    stream
        .language()
        .is_some_and(|l| l.eq_ignore_ascii_case(lang))
}

/// Turns a requested language into a selection over the available streams.
///
/// A language with no matching stream falls back to mapping everything.
pub fn select_streams(requested: &str, streams: &[StreamRecord]) -> StreamSelection {
    let requested = requested.trim();
    match requested.to_ascii_lowercase().as_str() {
        "" | "all" => StreamSelection::All,
        "none" | "nomap" => StreamSelection::None,
        _ if streams.iter().any(|s| language_matches(s, requested)) => {
            StreamSelection::Language(requested.to_string())
        }
        _ => StreamSelection::All,
    }
}

/// `-disposition` arguments making the first `lang` stream among `mapped`
/// the default for its kind. Indexes are relative to the output.
pub fn default_disposition_args(
    kind: StreamKind,
    lang: &str,
    mapped: &[&StreamRecord],
) -> Vec<String> {
    let Some(preferred) = mapped.iter().position(|s| language_matches(s, lang)) else {
        return Vec::new();
    };
    if mapped[preferred].disposition.is_default() {
        return Vec::new();
    }

    let selector = kind.specifier();
    let mut args = vec![format!("-disposition:{}:{}", selector, preferred), "default".to_string()];
    for (i, stream) in mapped.iter().enumerate() {
        if i != preferred && stream.disposition.is_default() {
            args.push(format!("-disposition:{}:{}", selector, i));
            args.push("0".to_string());
        }
    }
    args
}
