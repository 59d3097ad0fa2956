//! One run over the library: replay deferred moves, then convert files one
//! at a time.

use crate::config::Config;
use crate::decision::{decide, Decision, DecisionOptions};
use crate::deferred::{self, DeferredError};
use crate::encode::build_encoder_args;
use crate::fsops::{is_locked, FileOps, LocalFileOps};
use crate::probe::{FfprobeProber, MediaProber};
use crate::resolution::InvalidResolution;
use crate::scan::{scan_libraries, ScanCandidate, ScanRules};
use crate::supervisor::{EncodeError, EncodeSupervisor, SupervisorOptions};
use crate::transition::{work_path, TransitionError, TransitionManager, TransitionOutcome, TransitionRequest};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidResolution(#[from] InvalidResolution),

    #[error("deferred moves: {0}")]
    Deferred(#[from] DeferredError),

    #[error("transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("halted after failure on {path}: {reason}")]
    Halted { path: PathBuf, reason: String },
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub completed: usize,
    pub regressed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred_replayed: usize,
    pub bytes_saved: u64,
}

/// What happened to one file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Skipped(String),
    /// Probing or duration resolution failed; counted as a failure but never
    /// halts a run.
    Unprobeable(String),
    Transitioned(TransitionOutcome),
    Failed(String),
}

impl RunStats {
    fn record(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Skipped(_) => self.skipped += 1,
            FileOutcome::Transitioned(TransitionOutcome::Completed) => self.completed += 1,
            FileOutcome::Transitioned(TransitionOutcome::Regressed) => self.regressed += 1,
            FileOutcome::Unprobeable(_) | FileOutcome::Transitioned(_) | FileOutcome::Failed(_) => {
                self.failed += 1
            }
        }
    }
}

pub struct Pipeline {
    config: Config,
    options: DecisionOptions,
    prober: Arc<dyn MediaProber>,
    ops: Arc<dyn FileOps>,
    supervisor: EncodeSupervisor,
    transition: TransitionManager,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Pipeline using ffprobe and the local filesystem.
    pub fn new(config: Config, cancel: CancellationToken) -> Result<Self, PipelineError> {
        let prober = Arc::new(FfprobeProber::new(config.encode.ffprobe_path.clone()));
        Self::with_collaborators(config, prober, Arc::new(LocalFileOps), cancel)
    }

    pub fn with_collaborators(
        config: Config,
        prober: Arc<dyn MediaProber>,
        ops: Arc<dyn FileOps>,
        cancel: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let options = DecisionOptions::from_config(&config)?;
        let supervisor = EncodeSupervisor::new(SupervisorOptions::from_config(&config), cancel.clone());
        let transition = TransitionManager::new(&config, ops.clone(), prober.clone());
        Ok(Self {
            config,
            options,
            prober,
            ops,
            supervisor,
            transition,
            cancel,
        })
    }

    /// Replays deferred moves, then processes every scanned file in order.
    ///
    /// With `halt_on_error` set, the first failed file ends the run with
    /// [`PipelineError::Halted`].
    pub async fn run(&self) -> Result<RunStats, PipelineError> {
        let mut stats = RunStats::default();

        let replay = deferred::replay(&self.config.paths.deferred_dir, self.ops.as_ref()).await?;
        stats.deferred_replayed = replay.attempted();
        if replay.attempted() > 0 || replay.busy > 0 {
            info!(
                moved = replay.moved,
                failed = replay.failed,
                busy = replay.busy,
                "Replayed deferred moves"
            );
        }

        let candidates = scan_libraries(&self.config.paths.library_roots, &ScanRules::from_config(&self.config));
        info!(count = candidates.len(), "Found candidate files");

        for candidate in &candidates {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled, stopping before {}", candidate.path.display());
                break;
            }

            let span = info_span!("file", job_id = %Uuid::new_v4(), path = %candidate.path.display());
            let (outcome, bytes_saved) = self.process_file(candidate).instrument(span).await?;
            stats.record(&outcome);
            stats.bytes_saved += bytes_saved;

            let halting_failure = match &outcome {
                FileOutcome::Failed(reason) => Some(reason.clone()),
                FileOutcome::Transitioned(o @ (TransitionOutcome::TooSmall | TransitionOutcome::Failed)) => {
                    Some(format!("output {}", o))
                }
                _ => None,
            };
            if let Some(reason) = halting_failure {
                if self.config.transition.halt_on_error && !self.cancel.is_cancelled() {
                    return Err(PipelineError::Halted {
                        path: candidate.path.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            completed = stats.completed,
            regressed = stats.regressed,
            failed = stats.failed,
            skipped = stats.skipped,
            deferred_replayed = stats.deferred_replayed,
            bytes_saved = stats.bytes_saved,
            "Run finished"
        );
        Ok(stats)
    }

    /// Probes, decides, encodes and finalises one file. Returns the outcome
    /// and the bytes saved.
    pub async fn process_file(&self, candidate: &ScanCandidate) -> Result<(FileOutcome, u64), PipelineError> {
        let path = &candidate.path;

        match is_locked(path) {
            Ok(false) => {}
            Ok(true) => {
                warn!("File is locked by another process, skipping");
                return Ok((FileOutcome::Skipped("locked".to_string()), 0));
            }
            Err(e) => {
                warn!("File cannot be opened, skipping: {}", e);
                return Ok((FileOutcome::Skipped(e.to_string()), 0));
            }
        }

        let info = match self.prober.probe(path).await {
            Ok(info) => info,
            Err(e) => {
                error!("Probe failed, skipping: {}", e);
                return Ok((FileOutcome::Unprobeable(e.to_string()), 0));
            }
        };

        let output = work_path(
            path,
            &self.config.transition.work_suffix,
            &self.config.encode.container,
        );
        let plan = match decide(&info, &self.options, &output) {
            Decision::Skip(reason) => {
                info!("Skipping: {}", reason);
                return Ok((FileOutcome::Skipped(reason.to_string()), 0));
            }
            Decision::Encode(plan) => plan,
        };

        if let Some(target) = plan.resize.target() {
            info!(tier = %plan.source_tier, width = target.width, height = target.height, "Resizing");
        }
        info!(
            tier = %plan.source_tier,
            hdr = plan.hdr.is_some(),
            ten_bit = plan.ten_bit,
            "Encoding to {}",
            output.display()
        );

        let args = build_encoder_args(&plan, &self.config.encode);
        let report = self
            .supervisor
            .run(args, plan.duration_secs, |update| {
                if update.percent % 10 == 0 {
                    info!(percent = update.percent, speed = ?update.speed, "Encoding progress");
                } else {
                    debug!(percent = update.percent, speed = ?update.speed, "Encoding progress");
                }
            })
            .await;

        let report = match report {
            Ok(report) => report,
            Err(EncodeError::Cancelled) => {
                warn!("Encode cancelled");
                return Ok((FileOutcome::Failed("cancelled".to_string()), 0));
            }
            Err(e) => {
                error!("Encode failed: {}", e);
                return Ok((FileOutcome::Failed(e.to_string()), 0));
            }
        };
        if let Some(level) = report.fallback {
            info!(fallback = %level, "Encoded with reduced hardware acceleration");
        }

        let result = self
            .transition
            .finalize(TransitionRequest {
                source: &info,
                output: &plan.output,
                library_root: &candidate.library_root,
                resized: plan.resized(),
                force_convert: self.options.force_convert,
            })
            .await?;
        info!(outcome = %result.outcome, "File finished");

        Ok((FileOutcome::Transitioned(result.outcome), result.bytes_saved))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ContentKind;
    use crate::deferred::DeferredMove;
    use crate::probe::{MediaInfo, ProbeError};
    use crate::streams::{StreamKind, StreamRecord};
    use crate::test_support::{write_script, write_sized};
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    /// Working outputs probe as HEVC, everything else as the given codec.
    /// Files named `unprobeable` have no duration.
    struct StubProber {
        source_codec: &'static str,
    }

    #[async_trait]
    impl MediaProber for StubProber {
        async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
            if path.file_stem().is_some_and(|stem| stem == "unprobeable") {
                return Err(ProbeError::DurationUnresolved(path.to_path_buf()));
            }
            let size_bytes = tokio::fs::metadata(path).await?.len();
            let is_output = path.to_string_lossy().contains(".encoding.");
            let mut video = StreamRecord::new(StreamKind::Video);
            video.set("codec_name", if is_output { "hevc" } else { self.source_codec });
            video.set("width", "1920");
            video.set("height", "1080");
            Ok(MediaInfo {
                path: path.to_path_buf(),
                size_bytes,
                duration_secs: 600.0,
                video: vec![video],
                audio: Vec::new(),
                subtitle: Vec::new(),
            })
        }
    }

    /// ffmpeg stand-in: writes a sparse output of `output_mb` unless the
    /// target is the null sink, and reports progress.
    const FAKE_FFMPEG: &str = r#"
for last; do :; done
if [ "$last" != "-" ]; then
  echo "frame=10 time=00:05:00.00 speed=2.0x" >&2
  dd if=/dev/zero of="$last" bs=1 count=0 seek=$((OUTPUT_MB * 1048576)) 2>/dev/null
  echo "frame=20 time=00:10:00.00 speed=2.0x" >&2
fi
exit 0
"#;

    struct Fixture {
        dir: TempDir,
        library: PathBuf,
        config: Config,
    }

    fn fixture(ffmpeg_body: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let library = dir.path().join("library");
        std::fs::create_dir_all(&library).unwrap();
        let ffmpeg = write_script(dir.path(), "ffmpeg", ffmpeg_body);

        let mut config = Config::default();
        config.paths.library_roots = vec![library.clone()];
        config.paths.processed_root = Some(dir.path().join("processed"));
        config.paths.deferred_dir = dir.path().join("deferred");
        config.encode.ffmpeg_path = ffmpeg;
        config.encode.validation_attempts = 1;
        config.encode.validation_backoff_ms = 0;
        config.conversion.content_kind = ContentKind::Series;
        config.transition.remove_delay_secs = 0;
        config.transition.move_delay_secs = 0;
        config.transition.rename_delay_secs = 0;
        Fixture { dir, library, config }
    }

    fn pipeline(config: Config, source_codec: &'static str) -> Pipeline {
        Pipeline::with_collaborators(
            config,
            Arc::new(StubProber { source_codec }),
            Arc::new(LocalFileOps),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_converts_and_relocates() {
        let fx = fixture(&FAKE_FFMPEG.replace("OUTPUT_MB", "40"));
        // 300 MB over 10 minutes clears the FHD rate threshold
        write_sized(&fx.library.join("Show/ep1.mp4"), 300 * MB);

        let stats = pipeline(fx.config.clone(), "h264").run().await.unwrap();

        assert_eq!(stats.completed, 1);
        assert_eq!(stats.bytes_saved, 260 * MB);
        assert!(fx.library.join("Show/ep1.mkv").exists());
        assert!(!fx.library.join("Show/ep1.mp4").exists());
        assert!(fx.dir.path().join("processed/Show/ep1.mp4").exists());
    }

    #[tokio::test]
    async fn test_run_regressed_output_marks_original() {
        let fx = fixture(&FAKE_FFMPEG.replace("OUTPUT_MB", "400"));
        write_sized(&fx.library.join("ep1.mp4"), 300 * MB);

        let stats = pipeline(fx.config.clone(), "h264").run().await.unwrap();

        assert_eq!(stats.regressed, 1);
        assert!(!fx.library.join("ep1.encoding.mkv").exists());
        assert!(fx.library.join("ep1.processed.mp4").exists());
    }

    #[tokio::test]
    async fn test_already_target_codec_is_skipped() {
        let fx = fixture("exit 1");
        write_sized(&fx.library.join("ep1.mkv"), 300 * MB);

        let stats = pipeline(fx.config.clone(), "hevc").run().await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn test_encoder_failure_leaves_original() {
        let fx = fixture("exit 1");
        let source = fx.library.join("ep1.mp4");
        write_sized(&source, 300 * MB);

        let stats = pipeline(fx.config.clone(), "h264").run().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_halt_on_error_stops_the_run() {
        let mut fx = fixture("exit 1");
        fx.config.transition.halt_on_error = true;
        write_sized(&fx.library.join("a.mp4"), 300 * MB);
        write_sized(&fx.library.join("b.mp4"), 300 * MB);

        let err = pipeline(fx.config.clone(), "h264").run().await.unwrap_err();
        match err {
            PipelineError::Halted { path, .. } => assert_eq!(path, fx.library.join("a.mp4")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unprobeable_file_does_not_halt_the_run() {
        let mut fx = fixture(&FAKE_FFMPEG.replace("OUTPUT_MB", "40"));
        fx.config.transition.halt_on_error = true;
        write_sized(&fx.library.join("a/unprobeable.mp4"), 300 * MB);
        write_sized(&fx.library.join("b/ep2.mp4"), 300 * MB);

        let stats = pipeline(fx.config.clone(), "h264").run().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        assert!(fx.library.join("a/unprobeable.mp4").exists());
        assert!(fx.library.join("b/ep2.mkv").exists());
    }

    #[tokio::test]
    async fn test_deferred_moves_replay_first() {
        let fx = fixture("exit 1");
        let stranded = fx.dir.path().join("stranded.mkv");
        write_sized(&stranded, 10);
        let destination = fx.dir.path().join("processed/stranded.mkv");
        deferred::persist(&fx.config.paths.deferred_dir, &DeferredMove::new(&stranded, &destination)).unwrap();

        let stats = pipeline(fx.config.clone(), "h264").run().await.unwrap();
        assert_eq!(stats.deferred_replayed, 1);
        assert!(destination.exists());
        assert!(deferred::find_sidecars(&fx.config.paths.deferred_dir).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_processes_nothing() {
        let fx = fixture("exit 1");
        write_sized(&fx.library.join("ep1.mp4"), 300 * MB);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = Pipeline::with_collaborators(
            fx.config.clone(),
            Arc::new(StubProber { source_codec: "h264" }),
            Arc::new(LocalFileOps),
            cancel,
        )
        .unwrap();

        let stats = pipeline.run().await.unwrap();
        assert_eq!(stats, RunStats::default());
    }
}
