//! CLI entry point for mediashrink
//!
//! Loads configuration, sets up logging and runs one pass over the library.

use anyhow::{Context, Result};
use clap::Parser;
use mediashrink::config::{LoggingConfig, RefreshKind};
use mediashrink::{run_startup_checks, Config, Pipeline, RefreshClient, RunStats};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// mediashrink - re-encode a media library to a smaller codec
#[derive(Parser, Debug)]
#[command(name = "mediashrink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Files or directories to process instead of the configured library roots
    #[arg(short, long)]
    input: Vec<PathBuf>,

    /// Convert even when the size checks or codec say it is not worth it
    #[arg(long)]
    force_convert: bool,

    /// Resize even when the aspect ratio or scale direction says no
    #[arg(long)]
    force_resize: bool,

    /// Destination resolution, e.g. 1080p or 1280x720
    #[arg(short, long)]
    resolution: Option<String>,

    /// Log every encoder line
    #[arg(short, long)]
    verbose: bool,

    /// Skip the ffmpeg/ffprobe availability checks
    #[arg(long)]
    skip_checks: bool,

    /// Radarr movie to refresh after the run
    #[arg(long, env = "radarr_movie_id")]
    radarr_movie_id: Option<u64>,

    /// Sonarr series to refresh after the run
    #[arg(long, env = "sonarr_series_id")]
    sonarr_series_id: Option<u64>,
}

/// Reads the config file if there is one, then layers env and flags on top.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        Config::load_from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    apply_args(&mut config, args);
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn apply_args(config: &mut Config, args: &Args) {
    if !args.input.is_empty() {
        config.paths.library_roots = args.input.clone();
    }
    if args.force_convert {
        config.conversion.force_convert = true;
    }
    if args.force_resize {
        config.conversion.force_resize = true;
    }
    if let Some(resolution) = &args.resolution {
        config.conversion.destination_resolution = Some(resolution.clone());
    }
    if args.verbose {
        config.logging.verbose = true;
    }
}

/// Console layer on stderr plus an optional plain-text file layer.
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let default_level = if logging.verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();
    Ok(())
}

fn refresh_target(config: &Config, args: &Args) -> Option<(RefreshClient, u64)> {
    let refresh = config.refresh.as_ref()?;
    let id = match refresh.kind {
        RefreshKind::Radarr => args.radarr_movie_id?,
        RefreshKind::Sonarr => args.sonarr_series_id?,
    };
    Some((RefreshClient::new(refresh), id))
}

async fn run(args: Args) -> Result<RunStats> {
    let config = load_config(&args)?;
    init_tracing(&config.logging)?;

    if args.skip_checks {
        tracing::warn!("Skipping startup checks (--skip-checks enabled)");
    } else {
        run_startup_checks(&config).context("startup checks failed")?;
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping the current encode");
            on_signal.cancel();
        }
    });

    let pipeline = Pipeline::new(config.clone(), cancel)?;
    let stats = pipeline.run().await?;

    if let Some((client, id)) = refresh_target(&config, &args) {
        if let Err(e) = client.refresh(id).await {
            tracing::warn!(kind = ?client.kind(), id, "Title refresh failed: {}", e);
        }
    }

    Ok(stats)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(stats) if stats.failed > 0 => ExitCode::from(2),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("mediashrink: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
