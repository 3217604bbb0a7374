//! Video background replacement
//!
//! Decodes a video, segments every frame into foreground and background,
//! replaces the background with a solid color and re-encodes the result to
//! H.264 in an MP4 container.

pub mod codec;
pub mod compositor;
pub mod config;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod segmentation;

pub use config::{BackgroundColor, EncoderSettings, ModelConfig, ProcessorConfig};
pub use error::{CodecError, CompositorError, FrameError, PipelineError, SegmentationError};
#[cfg(feature = "ffmpeg")]
pub use pipeline::FfmpegBackend;
pub use pipeline::{
    spawn_processing, CancelToken, MediaBackend, ModeSwitch, PipelineStage, ProcessingHandle, RunSummary,
    SourceMedia, VideoProcessor,
};
pub use segmentation::{SegmentationEngine, SegmentationMode};
