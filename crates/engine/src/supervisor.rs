//! Encoder process supervision.
//!
//! A file goes `Validating -> Encoding -> Completed | Failed`. Validation runs
//! a short encode to a null sink and walks the hardware fallback ladder until
//! one argument set works. The real encode streams stderr record by record,
//! tracking progress and stopping on fatal errors. ffmpeg ends its status
//! reports with a bare carriage return, so both `\r` and `\n` end a record.

use crate::encode::{EncoderArgs, FallbackLevel};
use crate::progress::{classify_line, ProgressTracker};
use crate::retry::RetryPolicy;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stderr lines kept from a failed validation run.
const VALIDATION_TAIL_LINES: usize = 5;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder binary could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Every fallback level failed the validation pass
    #[error("validation failed after {attempts} attempts: {}", .last_errors.join(" | "))]
    ValidationExhausted {
        attempts: u32,
        last_errors: Vec<String>,
    },

    /// A fatal line appeared on stderr; the process was killed
    #[error("encoder reported a fatal error: {line}")]
    Fatal { line: String },

    /// Encoder exited unsuccessfully
    #[error("encoder exited with {status}")]
    Exit {
        status: ExitStatus,
        errors: Vec<String>,
    },

    /// Cancellation was requested while the encoder was running
    #[error("encode cancelled")]
    Cancelled,

    /// IO error while supervising
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of one supervised file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Validating,
    Encoding,
    Completed,
    Failed,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Validating => "validating",
            SupervisorState::Encoding => "encoding",
            SupervisorState::Completed => "completed",
            SupervisorState::Failed => "failed",
        }
    }
}

/// Progress notification sent whenever the whole percentage goes up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub speed: Option<f64>,
}

/// Result of a validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    /// Arguments that passed, possibly with hardware flags stripped.
    pub args: EncoderArgs,
    /// Deepest fallback level applied, if any.
    pub fallback: Option<FallbackLevel>,
    pub attempts: u32,
}

/// Summary of a finished encode.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeReport {
    pub fallback: Option<FallbackLevel>,
    pub component_errors: Vec<String>,
    pub last_speed: Option<f64>,
    pub percent: u8,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub ffmpeg: PathBuf,
    pub validation_seconds: u32,
    /// Retry budget and backoff for validation, not counting the first attempt.
    pub validation_retry: RetryPolicy,
    /// Log every stderr line, frame counters included.
    pub verbose: bool,
}

impl SupervisorOptions {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            ffmpeg: cfg.encode.ffmpeg_path.clone(),
            validation_seconds: cfg.encode.validation_seconds,
            validation_retry: RetryPolicy::exponential(
                cfg.encode.validation_attempts,
                Duration::from_millis(cfg.encode.validation_backoff_ms),
            ),
            verbose: cfg.logging.verbose,
        }
    }
}

/// Runs ffmpeg for one file at a time.
pub struct EncodeSupervisor {
    opts: SupervisorOptions,
    cancel: CancellationToken,
}

impl EncodeSupervisor {
    pub fn new(opts: SupervisorOptions, cancel: CancellationToken) -> Self {
        Self { opts, cancel }
    }

    /// Validates `args`, then runs the real encode.
    pub async fn run<F>(
        &self,
        args: EncoderArgs,
        duration_secs: f64,
        on_progress: F,
    ) -> Result<EncodeReport, EncodeError>
    where
        F: FnMut(ProgressUpdate),
    {
        let validated = self.validate(args).await?;
        let mut report = self.encode(&validated.args, duration_secs, on_progress).await?;
        report.fallback = validated.fallback;
        Ok(report)
    }

    /// Short test encode, degrading hardware acceleration on each failure.
    pub async fn validate(&self, mut args: EncoderArgs) -> Result<Validated, EncodeError> {
        debug!(
            state = SupervisorState::Validating.as_str(),
            input = %args.input().display(),
            "Validating encoder arguments"
        );

        let max_retries = self.opts.validation_retry.max_attempts;
        let mut ladder = FallbackLevel::LADDER.iter();
        let mut fallback = None;
        let mut attempts = 0;
        let mut retries = 0;

        loop {
            attempts += 1;
            let errors = match self.run_validation(&args).await? {
                None => {
                    return Ok(Validated {
                        args,
                        fallback,
                        attempts,
                    })
                }
                Some(errors) => errors,
            };

            if retries >= max_retries {
                return Err(EncodeError::ValidationExhausted {
                    attempts,
                    last_errors: errors,
                });
            }
            let Some(level) = ladder.by_ref().find(|level| level.apply(&mut args)) else {
                return Err(EncodeError::ValidationExhausted {
                    attempts,
                    last_errors: errors,
                });
            };

            retries += 1;
            let delay = self.opts.validation_retry.delay_for(retries);
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "validation failed, retrying {}",
                level
            );
            fallback = Some(*level);
            self.sleep_or_cancel(delay).await?;
        }
    }

    /// Returns `None` on success, or the tail of stderr on failure.
    async fn run_validation(&self, args: &EncoderArgs) -> Result<Option<Vec<String>>, EncodeError> {
        let mut cmd = self.command(args.validation_args(self.opts.validation_seconds));
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        let child = self.spawn(&mut cmd)?;

        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(EncodeError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        if output.status.success() {
            return Ok(None);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<String> = stderr
            .split(['\r', '\n'])
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        let tail = lines[lines.len().saturating_sub(VALIDATION_TAIL_LINES)..].to_vec();
        Ok(Some(tail))
    }

    /// Full encode with live stderr parsing.
    pub async fn encode<F>(
        &self,
        args: &EncoderArgs,
        duration_secs: f64,
        mut on_progress: F,
    ) -> Result<EncodeReport, EncodeError>
    where
        F: FnMut(ProgressUpdate),
    {
        info!(
            state = SupervisorState::Encoding.as_str(),
            output = %args.output().display(),
            "Starting encode"
        );

        let mut cmd = self.command(args.to_args());
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        let mut child = self.spawn(&mut cmd)?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("encoder stderr was not captured"))?;
        let mut records = StderrRecords::new(stderr);

        let mut monitor = LineMonitor::new(duration_secs, self.opts.verbose);
        let mut stderr_open = true;

        let status = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    terminate(&mut child).await;
                    return Err(EncodeError::Cancelled);
                }
                line = records.next_record(), if stderr_open => match line? {
                    Some(line) => {
                        if let Some(fatal) = monitor.observe(&line, &mut on_progress) {
                            terminate(&mut child).await;
                            return Err(EncodeError::Fatal { line: fatal });
                        }
                    }
                    None => stderr_open = false,
                },
                status = child.wait() => break status?,
            }
        };

        // Lines written just before exit
        while let Some(line) = records.next_record().await? {
            if let Some(fatal) = monitor.observe(&line, &mut on_progress) {
                return Err(EncodeError::Fatal { line: fatal });
            }
        }

        if !status.success() {
            return Err(EncodeError::Exit {
                status,
                errors: monitor.component_errors,
            });
        }

        Ok(EncodeReport {
            fallback: None,
            percent: monitor.tracker.percent(),
            component_errors: monitor.component_errors,
            last_speed: monitor.speed,
        })
    }

    fn command(&self, args: Vec<OsString>) -> Command {
        let mut cmd = Command::new(&self.opts.ffmpeg);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn spawn(&self, cmd: &mut Command) -> Result<Child, EncodeError> {
        cmd.spawn().map_err(|source| EncodeError::Spawn {
            program: self.opts.ffmpeg.display().to_string(),
            source,
        })
    }

    async fn sleep_or_cancel(&self, delay: Duration) -> Result<(), EncodeError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EncodeError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Splits a byte stream on `\r` and `\n`, decoding each record lossily.
///
/// Partial records stay buffered across calls, so `next_record` can be
/// dropped inside `select!` without losing output.
struct StderrRecords<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> StderrRecords<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// Next non-empty record, or `None` at end of stream.
    async fn next_record(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_pending()));
            }

            match available.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(end) => {
                    self.pending.extend_from_slice(&available[..end]);
                    self.reader.consume(end + 1);
                    if !self.pending.is_empty() {
                        return Ok(Some(self.take_pending()));
                    }
                }
                None => {
                    let len = available.len();
                    self.pending.extend_from_slice(available);
                    self.reader.consume(len);
                }
            }
        }
    }

    fn take_pending(&mut self) -> String {
        let record = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        record
    }
}

/// Kills the encoder and reaps it.
async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("failed to kill encoder: {}", e);
    }
}

/// Per-encode stderr state.
struct LineMonitor {
    tracker: ProgressTracker,
    speed: Option<f64>,
    component_errors: Vec<String>,
    verbose: bool,
}

impl LineMonitor {
    fn new(duration_secs: f64, verbose: bool) -> Self {
        Self {
            tracker: ProgressTracker::new(duration_secs),
            speed: None,
            component_errors: Vec::new(),
            verbose,
        }
    }

    /// Returns the line when it is fatal.
    fn observe<F: FnMut(ProgressUpdate)>(&mut self, line: &str, on_progress: &mut F) -> Option<String> {
        let info = classify_line(line);

        if info.component_error {
            warn!(line, "encoder component message");
            self.component_errors.push(line.to_string());
        }
        if info.fatal {
            return Some(line.to_string());
        }
        if let Some(speed) = info.speed {
            self.speed = Some(speed);
        }
        if let Some(elapsed) = info.time_secs {
            if let Some(percent) = self.tracker.update(elapsed) {
                on_progress(ProgressUpdate {
                    percent,
                    speed: self.speed,
                });
            }
        }

        if self.verbose {
            info!(target: "mediashrink::ffmpeg", "{}", line);
        } else if !info.frame_counter && !info.component_error {
            debug!(target: "mediashrink::ffmpeg", "{}", line);
        }
        None
    }
}
