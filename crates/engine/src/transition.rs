//! Post-encode file handling.
//!
//! Once the encoder has exited, the finished output is checked and either
//! kept (the original goes to the processed tree and the output takes its
//! name) or thrown away. The original is only touched on the kept branch or,
//! for a regression, renamed in place so it is not picked up again.

use crate::config::{Config, TransitionConfig};
use crate::decision::is_ten_bit;
use crate::deferred::{self, DeferredError, DeferredMove};
use crate::fsops::{move_with_retry, remove_with_retry, rename_with_retry, FileOps};
use crate::probe::{MediaInfo, MediaProber};
use crate::retry::RetryPolicy;
use crate::size_gate::{bytes_saved, check_size_gate, SizeGateResult, SizeGateRules};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("failed to persist deferred move: {0}")]
    Deferred(#[from] DeferredError),
}

/// How the transition ended for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Completed,
    Regressed,
    TooSmall,
    Failed,
}

impl TransitionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionOutcome::Completed => "completed",
            TransitionOutcome::Regressed => "regressed",
            TransitionOutcome::TooSmall => "too_small",
            TransitionOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for TransitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of the before/after comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSummary {
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub size_per_minute: u64,
    pub codec: String,
    pub profile: String,
    pub bit_depth: u8,
}

impl MediaSummary {
    pub fn from_info(info: &MediaInfo) -> Self {
        let video = info.primary_video();
        let bit_depth = video
            .and_then(|v| v.bits_per_raw_sample())
            .and_then(|b| b.parse().ok())
            .unwrap_or_else(|| if video.is_some_and(is_ten_bit) { 10 } else { 8 });

        Self {
            duration_secs: info.duration_secs,
            size_bytes: info.size_bytes,
            size_per_minute: info.size_per_minute(),
            codec: video.and_then(|v| v.codec_name()).unwrap_or("unknown").to_string(),
            profile: video.and_then(|v| v.profile()).unwrap_or("unknown").to_string(),
            bit_depth,
        }
    }
}

impl fmt::Display for MediaSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.0}s, {} MB, {} MB/min, {} ({}), {}-bit",
            self.duration_secs,
            self.size_bytes / (1024 * 1024),
            self.size_per_minute,
            self.codec,
            self.profile,
            self.bit_depth
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub source: MediaSummary,
    pub output: MediaSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionReport {
    pub outcome: TransitionOutcome,
    pub comparison: Option<Comparison>,
    pub bytes_saved: u64,
    /// Where the converted file ended up, if it was renamed into place.
    pub final_path: Option<PathBuf>,
    /// Sidecar written for a move that ran out of retries.
    pub deferred: Option<PathBuf>,
}

impl TransitionReport {
    fn new(outcome: TransitionOutcome) -> Self {
        Self {
            outcome,
            comparison: None,
            bytes_saved: 0,
            final_path: None,
            deferred: None,
        }
    }
}

/// The file being finalised.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRequest<'a> {
    pub source: &'a MediaInfo,
    /// Encoder output at its working name.
    pub output: &'a Path,
    /// Library root the source was found under.
    pub library_root: &'a Path,
    pub resized: bool,
    pub force_convert: bool,
}

/// `<stem>.<work_suffix>.<container>` beside `source`.
pub fn work_path(source: &Path, work_suffix: &str, container: &str) -> PathBuf {
    source.with_file_name(format!("{}.{}.{}", file_stem(source), work_suffix, container))
}

/// `<stem>.<container>` beside `source`.
pub fn final_path(source: &Path, container: &str) -> PathBuf {
    source.with_file_name(format!("{}.{}", file_stem(source), container))
}

/// `<stem>.<marker>.<ext>` beside `source`.
pub fn processed_marker_path(source: &Path, marker: &str) -> PathBuf {
    let name = match source.extension() {
        Some(ext) => format!("{}.{}.{}", file_stem(source), marker, ext.to_string_lossy()),
        None => format!("{}.{}", file_stem(source), marker),
    };
    source.with_file_name(name)
}

/// Root of the processed tree for `library_root`.
///
/// Without an explicit root this is a sibling directory named
/// `<root name>-<marker>`.
pub fn processed_root_for(library_root: &Path, processed_root: Option<&Path>, marker: &str) -> PathBuf {
    match processed_root {
        Some(root) => root.to_path_buf(),
        None => {
            let name = library_root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "library".to_string());
            library_root.with_file_name(format!("{}-{}", name, marker))
        }
    }
}

/// Where `source` goes in the processed tree, mirroring its place under
/// `library_root`.
pub fn processed_destination(source: &Path, library_root: &Path, processed_root: &Path) -> PathBuf {
    match source.strip_prefix(library_root) {
        Ok(relative) => processed_root.join(relative),
        Err(_) => processed_root.join(source.file_name().unwrap_or(source.as_os_str())),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct TransitionManager {
    cfg: TransitionConfig,
    processed_root: Option<PathBuf>,
    deferred_dir: PathBuf,
    container: String,
    ops: Arc<dyn FileOps>,
    prober: Arc<dyn MediaProber>,
}

impl TransitionManager {
    pub fn new(config: &Config, ops: Arc<dyn FileOps>, prober: Arc<dyn MediaProber>) -> Self {
        Self {
            cfg: config.transition.clone(),
            processed_root: config.paths.processed_root.clone(),
            deferred_dir: config.paths.deferred_dir.clone(),
            container: config.encode.container.clone(),
            ops,
            prober,
        }
    }

    fn remove_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.cfg.remove_attempts,
            Duration::from_secs(self.cfg.remove_delay_secs),
        )
    }

    fn move_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.cfg.move_attempts, Duration::from_secs(self.cfg.move_delay_secs))
    }

    fn rename_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.cfg.rename_attempts,
            Duration::from_secs(self.cfg.rename_delay_secs),
        )
    }

    /// Checks the output and moves files into their final places.
    ///
    /// Only a failure to write a deferred-move sidecar is returned as an
    /// error; every other problem ends in [`TransitionOutcome::Failed`] with
    /// the original left where it was.
    pub async fn finalize(&self, req: TransitionRequest<'_>) -> Result<TransitionReport, TransitionError> {
        let source = &req.source.path;

        let output_bytes = match tokio::fs::metadata(req.output).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!(output = %req.output.display(), "Encoder output missing: {}", e);
                return Ok(TransitionReport::new(TransitionOutcome::Failed));
            }
        };

        let rules = SizeGateRules {
            min_output_bytes: self.cfg.min_output_bytes,
            resized: req.resized,
            force_convert: req.force_convert,
        };
        if let SizeGateResult::TooSmall { min_bytes, .. } =
            check_size_gate(req.source.size_bytes, output_bytes, &rules)
        {
            error!(
                output = %req.output.display(),
                output_bytes,
                min_bytes,
                "Output is below the minimum viable size, discarding"
            );
            self.discard(req.output).await;
            return Ok(TransitionReport::new(TransitionOutcome::TooSmall));
        }

        let output_info = match self.prober.probe(req.output).await {
            Ok(info) => info,
            Err(e) => {
                error!(output = %req.output.display(), "Could not probe output: {}", e);
                return Ok(TransitionReport::new(TransitionOutcome::Failed));
            }
        };
        let comparison = Comparison {
            source: MediaSummary::from_info(req.source),
            output: MediaSummary::from_info(&output_info),
        };

        match check_size_gate(req.source.size_bytes, output_info.size_bytes, &rules) {
            SizeGateResult::Regressed {
                input_bytes,
                output_bytes,
            } => {
                warn!(
                    path = %source.display(),
                    input_bytes,
                    output_bytes,
                    "Output is not smaller than the source, discarding"
                );
                self.discard(req.output).await;
                if self.cfg.move_on_completion {
                    self.mark_processed(source).await;
                }
                let mut report = TransitionReport::new(TransitionOutcome::Regressed);
                report.comparison = Some(comparison);
                Ok(report)
            }
            SizeGateResult::TooSmall { .. } => {
                self.discard(req.output).await;
                Ok(TransitionReport::new(TransitionOutcome::TooSmall))
            }
            SizeGateResult::Accept => self.complete(req, comparison).await,
        }
    }

    async fn complete(
        &self,
        req: TransitionRequest<'_>,
        comparison: Comparison,
    ) -> Result<TransitionReport, TransitionError> {
        let source = &req.source.path;
        let target = final_path(source, &self.container);
        let mut report = TransitionReport::new(TransitionOutcome::Completed);
        report.bytes_saved = bytes_saved(comparison.source.size_bytes, comparison.output.size_bytes);

        if self.cfg.move_on_completion {
            let root = processed_root_for(
                req.library_root,
                self.processed_root.as_deref(),
                &self.cfg.processed_marker,
            );
            let destination = processed_destination(source, req.library_root, &root);
            if let Err(e) = move_with_retry(self.ops.as_ref(), &self.move_policy(), source, &destination).await {
                error!(
                    from = %source.display(),
                    to = %destination.display(),
                    "Moving original failed, deferring to next run: {}",
                    e
                );
                let mut mv = DeferredMove::new(source, &destination);
                // The output can only take the original's name once it has moved
                if target == *source {
                    mv = mv.with_rename(req.output, &target);
                }
                let sidecar = deferred::persist(&self.deferred_dir, &mv)?;
                report.deferred = Some(sidecar);
            }
        } else if let Err(e) = remove_with_retry(self.ops.as_ref(), &self.remove_policy(), source).await {
            error!(path = %source.display(), "Removing original failed: {}", e);
        }

        if report.deferred.is_some() && target == *source {
            info!(output = %req.output.display(), "Output rename queued behind the deferred move");
        } else if tokio::fs::try_exists(&target).await.unwrap_or(true) {
            warn!(
                output = %req.output.display(),
                target = %target.display(),
                "Final name is still taken, leaving output under its working name"
            );
        } else {
            match rename_with_retry(self.ops.as_ref(), &self.rename_policy(), req.output, &target).await {
                Ok(()) => report.final_path = Some(target),
                Err(e) => error!(
                    output = %req.output.display(),
                    target = %target.display(),
                    "Renaming output failed: {}",
                    e
                ),
            }
        }

        info!(path = %source.display(), "Source: {}", comparison.source);
        info!(path = %source.display(), "Output: {}", comparison.output);
        report.comparison = Some(comparison);
        Ok(report)
    }

    async fn discard(&self, output: &Path) {
        if let Err(e) = remove_with_retry(self.ops.as_ref(), &self.remove_policy(), output).await {
            error!(output = %output.display(), "Could not delete discarded output: {}", e);
        }
    }

    async fn mark_processed(&self, source: &Path) {
        let marked = processed_marker_path(source, &self.cfg.processed_marker);
        match rename_with_retry(self.ops.as_ref(), &self.rename_policy(), source, &marked).await {
            Ok(()) => info!(path = %marked.display(), "Marked original as processed"),
            Err(e) => error!(path = %source.display(), "Could not mark original as processed: {}", e),
        }
    }
}
