use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by a segmentation strategy or its inference backend
#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("failed to load model from {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("unexpected model output shape {shape:?}: {reason}")]
    OutputShape { shape: Vec<usize>, reason: String },

    #[error("no strategy configured for mode {0}")]
    StrategyUnavailable(crate::segmentation::SegmentationMode),

    #[error(transparent)]
    Ort(#[from] ort::Error),
}

/// Errors raised by a compositor. Every variant is fatal for the current run.
#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("compositor not initialized")]
    NotInitialized,

    #[error("no suitable GPU adapter found")]
    AdapterUnavailable,

    #[error("failed to create GPU device: {0}")]
    DeviceCreation(String),

    #[error("rendering context is owned by another thread")]
    ContextNotCurrent,

    #[error("GPU error during {operation}: {message}")]
    Gpu { operation: &'static str, message: String },

    #[error("plane {plane} has {actual} bytes, expected {expected}")]
    PlaneSize {
        plane: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("mask has {actual} values, expected {width}x{height}")]
    MaskSize { width: u32, height: u32, actual: usize },

    #[error("encoder surface closed")]
    SurfaceClosed,

    #[error("encoder surface is full")]
    SurfaceFull,
}

/// Errors raised by demuxer, decoder, encoder or muxer adapters
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to open source {0}")]
    OpenFailed(String),

    #[error("no video track found in source")]
    NoVideoTrack,

    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),

    #[error("failed to create encoder: {0}")]
    EncoderCreation(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("muxer error: {0}")]
    Muxer(String),

    #[error("muxer written to before start")]
    MuxerNotStarted,

    #[error("unknown output buffer {0}")]
    UnknownBuffer(u64),

    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),
}

/// Errors raised while handling a single decoded frame. `Compositor` aborts the run, the rest skip the frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("plane {plane}: {reason}")]
    PlaneExtraction { plane: &'static str, reason: String },

    #[error("segmentation failed: {0}")]
    Segmentation(#[from] SegmentationError),

    #[error("compositor failed: {0}")]
    Compositor(#[from] CompositorError),
}

/// Invalid configuration values
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("EMA alpha must be within [0, 1], got {0}")]
    EmaAlpha(f32),

    #[error("hole fill kernel must be odd and positive, got {0}")]
    HoleFillKernel(u32),

    #[error("model input size must be positive, got {0}x{1}")]
    ModelSize(u32, u32),

    #[error("invalid background color {0:?}, expected #RRGGBB")]
    BackgroundColor(String),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Errors that terminate a processing run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("processor not initialized")]
    NotInitialized,

    #[error("processing cancelled")]
    Cancelled,

    #[error("invalid pipeline transition {from:?} -> {to:?}")]
    InvalidStage {
        from: crate::pipeline::PipelineStage,
        to: crate::pipeline::PipelineStage,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("fatal compositor error at frame {frame}: {source}")]
    Compositor {
        frame: u64,
        #[source]
        source: CompositorError,
    },

    #[error("compositor setup failed: {0}")]
    CompositorSetup(CompositorError),

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
