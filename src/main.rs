use std::path::PathBuf;

use anyhow::{Context, Result};
use backdrop::{BackgroundColor, FfmpegBackend, ProcessorConfig, SegmentationMode, VideoProcessor};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source video file
    input: PathBuf,

    /// Output MP4 file
    output: PathBuf,

    /// JSON config file; command line flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Segmentation strategy
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Person segmentation model (ONNX file)
    #[arg(long)]
    person_model: Option<PathBuf>,

    /// Multi-class segmentation model (ONNX file)
    #[arg(long)]
    objects_model: Option<PathBuf>,

    /// EMA coefficient for person mode, 0.99 or above disables smoothing
    #[arg(long)]
    ema_alpha: Option<f32>,

    /// Background color as #RRGGBB
    #[arg(short, long)]
    background: Option<String>,

    /// Fill mask holes with a morphological close of this (odd) size
    #[arg(long)]
    hole_fill: Option<u32>,

    /// Show matte visualization (grayscale silhouette) instead of the composited video
    #[arg(long)]
    show_matte: bool,

    /// Composite on the CPU instead of the GPU
    #[arg(long)]
    cpu_composite: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Person,
    AllObjects,
}

impl From<Mode> for SegmentationMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Person => SegmentationMode::PersonOnly,
            Mode::AllObjects => SegmentationMode::AllObjects,
        }
    }
}

fn build_config(args: &Args) -> Result<ProcessorConfig> {
    let mut config = match &args.config {
        Some(path) => ProcessorConfig::from_json_file(path)?,
        None => ProcessorConfig::default(),
    };

    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if let Some(path) = &args.person_model {
        config.person_model.path = Some(path.clone());
    }
    if let Some(path) = &args.objects_model {
        config.objects_model.path = Some(path.clone());
    }
    if let Some(alpha) = args.ema_alpha {
        config.ema_alpha = alpha;
    }
    if let Some(hex) = &args.background {
        config.background = BackgroundColor::from_hex(hex)?;
    }
    if args.hole_fill.is_some() {
        config.hole_fill_kernel = args.hole_fill;
    }
    config.show_matte |= args.show_matte;
    config.cpu_composite |= args.cpu_composite;

    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .init();

    tracing::info!("backdrop starting");

    let config = build_config(&args).context("Invalid configuration")?;
    tracing::info!("Mode: {}", config.mode);
    tracing::info!("Background: {:?}", config.background.to_rgb8());

    let mut processor =
        VideoProcessor::new(config, Box::new(FfmpegBackend)).context("Failed to create video processor")?;
    processor
        .initialize()
        .context("Failed to load segmentation models")?;

    let mut last_percent = 0u32;
    let mut on_progress = |fraction: f32| {
        let percent = (fraction * 100.0) as u32;
        if percent >= last_percent + 5 {
            last_percent = percent;
            tracing::info!("Progress: {}%", percent);
        }
    };
    let mut on_debug = |message: &str| tracing::debug!("{}", message);

    let summary = processor
        .process_video(&args.input, &args.output, &mut on_progress, &mut on_debug)
        .with_context(|| format!("Failed to process {}", args.input.display()));
    processor.release();
    let summary = summary?;

    tracing::info!(
        "Wrote {} ({} frames, {} skipped) in {:.1}s",
        args.output.display(),
        summary.frames_rendered,
        summary.frames_failed,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}
