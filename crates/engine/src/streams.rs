//! Stream metadata parser.
//!
//! Turns the block-delimited text that ffprobe prints with `-show_streams`
//! into typed [`StreamRecord`] values. Parsing is pure: no processes are run
//! here, the prober supplies the raw text.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const BLOCK_OPEN: &str = "[stream]";
const BLOCK_CLOSE: &str = "[/stream]";
const DISPOSITION_PREFIX: &str = "disposition:";
const TAG_PREFIX: &str = "tag:";

/// Kind of elementary stream a probe dump describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
    Subtitle,
}

impl StreamKind {
    /// Name as used by ffprobe (`codec_type`) and by `-select_streams`.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Subtitle => "subtitle",
        }
    }

    /// Single-letter specifier used by ffmpeg stream selectors.
    pub fn specifier(&self) -> &'static str {
        match self {
            StreamKind::Audio => "a",
            StreamKind::Video => "v",
            StreamKind::Subtitle => "s",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a stream kind name is not one of audio, video or subtitle.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown stream kind: {0}")]
pub struct UnknownStreamKind(pub String);

impl FromStr for StreamKind {
    type Err = UnknownStreamKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" | "a" => Ok(StreamKind::Audio),
            "video" | "v" => Ok(StreamKind::Video),
            "subtitle" | "s" => Ok(StreamKind::Subtitle),
            other => Err(UnknownStreamKind(other.to_string())),
        }
    }
}

/// Disposition flags of one stream (`default`, `forced`, `hearing_impaired`, ...).
///
/// Shared by every stream kind instead of each kind carrying its own list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disposition {
    flags: BTreeMap<String, bool>,
}

impl Disposition {
    pub fn set(&mut self, name: &str, value: bool) {
        self.flags.insert(name.to_ascii_lowercase(), value);
    }

    /// Missing flags read as false.
    pub fn get(&self, name: &str) -> bool {
        self.flags
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or(false)
    }

    pub fn is_default(&self) -> bool {
        self.get("default")
    }

    pub fn is_forced(&self) -> bool {
        self.get("forced")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.flags.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

/// One audio, video or subtitle stream from a probe dump.
///
/// Every field is optional; accessors return `None` for absent or empty values.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub kind: StreamKind,
    fields: Vec<(String, String)>,
    pub disposition: Disposition,
}

impl StreamRecord {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            fields: Vec::new(),
            disposition: Disposition::default(),
        }
    }

    /// Sets a field; a later write to the same key replaces the value in place.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.fields.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Fields in the order they first appeared.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn index(&self) -> Option<u32> {
        self.get_parsed("index")
    }

    pub fn codec_name(&self) -> Option<&str> {
        self.get("codec_name")
    }

    /// Language tag, as written by `TAG:language=`.
    pub fn language(&self) -> Option<&str> {
        self.get("language")
    }

    pub fn title(&self) -> Option<&str> {
        self.get("title")
    }

    pub fn profile(&self) -> Option<&str> {
        self.get("profile")
    }

    pub fn pix_fmt(&self) -> Option<&str> {
        self.get("pix_fmt")
    }

    pub fn bits_per_raw_sample(&self) -> Option<&str> {
        self.get("bits_per_raw_sample")
    }

    pub fn color_primaries(&self) -> Option<&str> {
        self.get("color_primaries")
    }

    pub fn color_transfer(&self) -> Option<&str> {
        self.get("color_transfer")
    }

    pub fn color_space(&self) -> Option<&str> {
        self.get("color_space")
    }

    pub fn width(&self) -> Option<u32> {
        self.get_parsed("width")
    }

    pub fn height(&self) -> Option<u32> {
        self.get_parsed("height")
    }

    /// Stream duration in seconds (`duration=`), ignoring `N/A`.
    pub fn duration_secs(&self) -> Option<f64> {
        self.get_parsed::<f64>("duration").filter(|d| *d > 0.0)
    }

    pub fn bit_rate(&self) -> Option<u64> {
        self.get_parsed("bit_rate")
    }
}

/// Parses every `[STREAM]...[/STREAM]` block of `text` into records of `kind`.
///
/// Blocks that are empty or never closed produce no record. Lines outside a
/// block and lines without `=` are ignored.
pub fn parse_streams(text: &str, kind: StreamKind) -> Vec<StreamRecord> {
    let mut records = Vec::new();
    let mut current: Option<StreamRecord> = None;
    let mut populated = false;

    for raw in text.lines() {
        let line = raw.trim();
        let lower = line.to_ascii_lowercase();

        if lower == BLOCK_OPEN {
            current = Some(StreamRecord::new(kind));
            populated = false;
            continue;
        }
        if lower == BLOCK_CLOSE {
            if let Some(record) = current.take() {
                if populated {
                    records.push(record);
                }
            }
            continue;
        }

        let Some(record) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        if starts_with_ignore_case(key, DISPOSITION_PREFIX) {
            let name = &key[DISPOSITION_PREFIX.len()..];
            record.disposition.set(name, value.trim() == "1");
        } else if starts_with_ignore_case(key, TAG_PREFIX) {
            record.set(&key[TAG_PREFIX.len()..], value);
        } else {
            record.set(key, value);
        }
        populated = true;
    }

    records
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}
