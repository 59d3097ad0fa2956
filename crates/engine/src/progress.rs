//! Encoder stderr line classification and progress tracking.

use crate::probe::parse_clock;
use regex::Regex;
use std::sync::OnceLock;

static COMPONENT_RE: OnceLock<Option<Regex>> = OnceLock::new();
static ERROR_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TOLERATED_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TIME_RE: OnceLock<Option<Regex>> = OnceLock::new();
static SPEED_RE: OnceLock<Option<Regex>> = OnceLock::new();
static FRAME_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, line: &str) -> bool {
    cached(cell, pattern).is_some_and(|re| re.is_match(line))
}

/// What one stderr line tells the supervisor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineInfo {
    /// `[component @ address]` prefix; collected for the failure report.
    pub component_error: bool,
    /// Mentions an error that is not on the tolerated list.
    pub fatal: bool,
    /// Seconds of output written so far.
    pub time_secs: Option<f64>,
    /// Encode speed as a multiple of real time.
    pub speed: Option<f64>,
    /// High-frequency `frame=` status line.
    pub frame_counter: bool,
}

/// Classifies one line of ffmpeg stderr.
pub fn classify_line(line: &str) -> LineInfo {
    let component_error = matches(&COMPONENT_RE, r"\[([^\]@\s]+)\s*@\s*([^\]]+)\]", line);
    let fatal = matches(&ERROR_RE, r"(?i)error", line)
        && !matches(
            &TOLERATED_RE,
            r"(?i)(error while decoding stream #\d+:\d+|invalid data found when processing input)",
            line,
        );

    let time_secs = cached(&TIME_RE, r"time=\s*(\d+:\d{2}:\d{2}(?:\.\d+)?)")
        .and_then(|re| re.captures(line))
        .and_then(|caps| parse_clock(&caps[1]));
    let speed = cached(&SPEED_RE, r"speed=\s*(\d+(?:\.\d+)?)x")
        .and_then(|re| re.captures(line))
        .and_then(|caps| caps[1].parse::<f64>().ok());
    let frame_counter = matches(&FRAME_RE, r"^\s*(frame|size)=", line);

    LineInfo {
        component_error,
        fatal,
        time_secs,
        speed,
        frame_counter,
    }
}

/// Turns elapsed output time into whole percentages, reporting each value once.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_secs: f64,
    last_percent: Option<u8>,
}

impl ProgressTracker {
    pub fn new(total_secs: f64) -> Self {
        Self {
            total_secs,
            last_percent: None,
        }
    }

    /// Returns the new percentage only when it is higher than any seen before.
    pub fn update(&mut self, elapsed_secs: f64) -> Option<u8> {
        if self.total_secs <= 0.0 || !elapsed_secs.is_finite() {
            return None;
        }
        let percent = ((elapsed_secs / self.total_secs) * 100.0).floor().clamp(0.0, 100.0) as u8;
        if self.last_percent.is_some_and(|last| percent <= last) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }

    pub fn percent(&self) -> u8 {
        self.last_percent.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_progress_line() {
        let info = classify_line(
            "frame= 2400 fps= 80 q=28.0 size=   10240kB time=00:01:40.00 bitrate= 838.9kbits/s speed=3.34x",
        );
        assert_eq!(info.time_secs, Some(100.0));
        assert_eq!(info.speed, Some(3.34));
        assert!(info.frame_counter);
        assert!(!info.fatal);
        assert!(!info.component_error);
    }

    #[test]
    fn test_final_status_line_with_padding() {
        let info = classify_line(
            "frame= 1250 fps= 50 q=-1.0 Lsize=    5120kB time=00:00:50.00 bitrate= 838.9kbits/s speed=2.20x    ",
        );
        assert_eq!(info.time_secs, Some(50.0));
        assert_eq!(info.speed, Some(2.2));
        assert!(info.frame_counter);
    }

    #[test]
    fn test_time_not_available_yet() {
        let info = classify_line("frame=    0 fps=0.0 q=0.0 size=       0kB time=N/A bitrate=N/A speed=N/A");
        assert_eq!(info.time_secs, None);
        assert_eq!(info.speed, None);
    }

    #[test]
    fn test_component_line_is_collected() {
        let info = classify_line("[hevc_qsv @ 0x55d0c8e0a2c0] Selected ratecontrol mode is unsupported");
        assert!(info.component_error);
        assert!(!info.fatal);
    }

    #[test]
    fn test_generic_error_is_fatal() {
        let info = classify_line("[vost#0:0/hevc_qsv @ 0x5581] Error initializing output stream");
        assert!(info.component_error);
        assert!(info.fatal);
        assert!(classify_line("Conversion failed! error opening output").fatal);
    }

    #[test]
    fn test_tolerated_errors_are_not_fatal() {
        assert!(!classify_line("Error while decoding stream #0:1: Invalid data found when processing input").fatal);
        assert!(!classify_line("[aac @ 0x1] error while decoding stream #0:2").fatal);
        assert!(!classify_line("Invalid data found when processing input").fatal);
    }

    #[test]
    fn test_tracker_reports_strict_increases_only() {
        let mut tracker = ProgressTracker::new(200.0);
        assert_eq!(tracker.update(2.0), Some(1));
        assert_eq!(tracker.update(2.0), None);
        assert_eq!(tracker.update(2.5), None);
        assert_eq!(tracker.update(1.0), None);
        assert_eq!(tracker.update(100.0), Some(50));
        assert_eq!(tracker.update(400.0), Some(100));
        assert_eq!(tracker.update(500.0), None);
        assert_eq!(tracker.percent(), 100);
    }

    #[test]
    fn test_tracker_without_duration_reports_nothing() {
        let mut tracker = ProgressTracker::new(0.0);
        assert_eq!(tracker.update(10.0), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_reported_percentages_strictly_increase(
            times in proptest::collection::vec(0u32..7200, 1..50),
            total in 60u32..7200,
        ) {
            let mut tracker = ProgressTracker::new(total as f64);
            let mut reported = Vec::new();
            for t in times {
                let line = format!(
                    "frame=1 time={:02}:{:02}:{:02}.00 speed=1.0x",
                    t / 3600, (t / 60) % 60, t % 60
                );
                let info = classify_line(&line);
                prop_assert_eq!(info.time_secs, Some(t as f64));
                if let Some(p) = tracker.update(t as f64) {
                    reported.push(p);
                }
            }
            prop_assert!(reported.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
