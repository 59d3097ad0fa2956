//! Resolution tiers and the per-tier size heuristics built on them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Coarse resolution bucket, ordered from smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResolutionTier {
    Unknown,
    Sd,
    Dvd,
    Hd,
    Fhd,
    Qhd,
    Uhd4k,
    Fuhd8k,
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionTier::Unknown => "UNKNOWN",
            ResolutionTier::Sd => "SD",
            ResolutionTier::Dvd => "DVD",
            ResolutionTier::Hd => "HD",
            ResolutionTier::Fhd => "FHD",
            ResolutionTier::Qhd => "QHD",
            ResolutionTier::Uhd4k => "UHD_4K",
            ResolutionTier::Fuhd8k => "FUHD_8K",
        };
        f.write_str(name)
    }
}

/// Classifies a frame size.
///
/// The bands overlap numerically; the first matching rung wins and the order
/// below must not change.
pub fn classify(width: u32, height: u32) -> ResolutionTier {
    if width == 0 || height == 0 {
        ResolutionTier::Unknown
    } else if width <= 500 && height <= 400 {
        ResolutionTier::Sd
    } else if width >= 500 && height <= 600 {
        ResolutionTier::Dvd
    } else if width >= 900 && height < 780 {
        ResolutionTier::Hd
    } else if width >= 1400 && height < 1400 {
        ResolutionTier::Fhd
    } else if width >= 2000 && height < 1700 {
        ResolutionTier::Qhd
    } else if width >= 3000 && height <= 2160 {
        ResolutionTier::Uhd4k
    } else if height > 2160 {
        ResolutionTier::Fuhd8k
    } else {
        ResolutionTier::Unknown
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn tier(&self) -> ResolutionTier {
        classify(self.width, self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Width over height; zero when height is zero.
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f64 / self.height as f64
        }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognised resolution '{0}', expected WIDTHxHEIGHT or a tier name")]
pub struct InvalidResolution(pub String);

impl FromStr for Dimensions {
    type Err = InvalidResolution;

    /// Accepts `1920x1080` or a tier name such as `fhd`, `4k` or `dvd`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        let named = match value.as_str() {
            "sd" => Some((480, 360)),
            "dvd" => Some((720, 480)),
            "hd" | "720p" => Some((1280, 720)),
            "fhd" | "1080p" => Some((1920, 1080)),
            "qhd" | "1440p" => Some((2560, 1440)),
            "4k" | "uhd" | "uhd_4k" | "2160p" => Some((3840, 2160)),
            "8k" | "fuhd" | "fuhd_8k" | "4320p" => Some((7680, 4320)),
            _ => None,
        };
        if let Some((width, height)) = named {
            return Ok(Dimensions::new(width, height));
        }

        let (w, h) = value
            .split_once('x')
            .ok_or_else(|| InvalidResolution(s.to_string()))?;
        let width = w.trim().parse().map_err(|_| InvalidResolution(s.to_string()))?;
        let height = h.trim().parse().map_err(|_| InvalidResolution(s.to_string()))?;
        Ok(Dimensions::new(width, height))
    }
}

/// Minimum megabytes per minute worth re-encoding for a tier.
pub fn size_per_minute_threshold(tier: ResolutionTier) -> u64 {
    match tier {
        ResolutionTier::Sd => 5,
        ResolutionTier::Dvd => 7,
        ResolutionTier::Hd => 15,
        ResolutionTier::Fhd => 20,
        ResolutionTier::Qhd => 30,
        ResolutionTier::Uhd4k => 40,
        ResolutionTier::Unknown | ResolutionTier::Fuhd8k => 27,
    }
}

/// Absolute size floors for movies, in GiB, checked in order.
///
/// HD appears twice; only the first entry can ever match.
pub const MOVIE_SIZE_FLOORS_GIB: &[(ResolutionTier, f64)] = &[
    (ResolutionTier::Sd, 0.8),
    (ResolutionTier::Dvd, 1.2),
    (ResolutionTier::Hd, 1.5),
    (ResolutionTier::Hd, 3.5),
    (ResolutionTier::Fhd, 5.0),
    (ResolutionTier::Qhd, 7.0),
    (ResolutionTier::Uhd4k, 9.0),
];

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Returns the floor in GiB a movie of `size_bytes` fell under, if any.
pub fn movie_floor_blocks(tier: ResolutionTier, size_bytes: u64) -> Option<f64> {
    let (_, floor) = MOVIE_SIZE_FLOORS_GIB.iter().find(|(t, _)| *t == tier)?;
    let size_gib = size_bytes as f64 / GIB;
    (size_gib < *floor).then_some(*floor)
}
