//! Encoder invocation: argument building and the hardware fallback ladder.

pub mod ffmpeg;

pub use ffmpeg::{build_encoder_args, quality_flag, EncoderArgs, FallbackLevel};
