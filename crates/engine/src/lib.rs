//! mediashrink
//!
//! Batch re-encoding of a media library: probe each file, decide whether a
//! conversion is worth it, run ffmpeg under supervision and put the result
//! in place of the original.

pub mod decision;
pub mod deferred;
pub mod encode;
pub mod fsops;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod refresh;
pub mod resolution;
pub mod retry;
pub mod scan;
pub mod size_gate;
pub mod startup;
pub mod streams;
pub mod supervisor;
pub mod transition;

#[cfg(test)]
mod test_support;

pub use mediashrink_config as config;
pub use mediashrink_config::Config;
pub use decision::{decide, Decision, DecisionOptions, EncodePlan, SkipReason};
pub use deferred::{DeferredError, DeferredMove, PendingRename, ReplaySummary};
pub use encode::{build_encoder_args, EncoderArgs, FallbackLevel};
pub use fsops::{FileOps, LocalFileOps};
pub use pipeline::{FileOutcome, Pipeline, PipelineError, RunStats};
pub use probe::{FfprobeProber, MediaInfo, MediaProber, ProbeError};
pub use refresh::{RefreshClient, RefreshError};
pub use resolution::{classify, Dimensions, ResolutionTier};
pub use retry::RetryPolicy;
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError, ToolVersions};
pub use streams::{parse_streams, Disposition, StreamKind, StreamRecord};
pub use supervisor::{EncodeError, EncodeSupervisor, ProgressUpdate, SupervisorOptions};
pub use transition::{TransitionManager, TransitionOutcome, TransitionReport};
