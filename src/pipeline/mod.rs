//! Pipeline orchestration
//!
//! [`VideoProcessor`] is the invocation surface: `initialize`, `process_video`,
//! `set_segmentation_mode` and `release`. A run pulls access units from the
//! demuxer into the decoder, segments and composites every decoded frame, and
//! pulls encoded units from the encoder into the muxer, all from one thread.

mod progress;
mod run;
mod stage;

pub use progress::ProgressTracker;
pub use stage::PipelineStage;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::codec::{Demuxer, Muxer, VideoDecoder, VideoEncoder};
use crate::compositor::{Compositor, CompositorSettings, CpuCompositor, WgpuCompositor};
use crate::config::{EncoderSettings, ProcessorConfig};
use crate::error::{CodecError, PipelineError, Result};
use crate::segmentation::{SegmentationEngine, SegmentationMode};

/// Decoder output buffers handed out at once
pub const DECODER_POOL_SIZE: usize = 4;

/// Demuxer and decoder for one opened source
pub struct SourceMedia {
    pub demuxer: Box<dyn Demuxer>,
    pub decoder: Box<dyn VideoDecoder>,
}

/// Creates the codec side of a run
pub trait MediaBackend: Send {
    fn open_source(&self, input: &Path) -> Result<SourceMedia, CodecError>;

    fn create_encoder(
        &self,
        width: u32,
        height: u32,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn VideoEncoder>, CodecError>;

    fn create_muxer(&self, output: &Path) -> Result<Box<dyn Muxer>, CodecError>;
}

/// FFmpeg demux/decode/encode/mux
#[cfg(feature = "ffmpeg")]
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBackend;

#[cfg(feature = "ffmpeg")]
impl MediaBackend for FfmpegBackend {
    fn open_source(&self, input: &Path) -> Result<SourceMedia, CodecError> {
        let (demuxer, decoder) = crate::codec::ffmpeg::open_source(input, DECODER_POOL_SIZE)?;
        Ok(SourceMedia {
            demuxer: Box::new(demuxer),
            decoder: Box::new(decoder),
        })
    }

    fn create_encoder(
        &self,
        width: u32,
        height: u32,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn VideoEncoder>, CodecError> {
        Ok(Box::new(crate::codec::ffmpeg::FfmpegEncoder::new(width, height, settings)?))
    }

    fn create_muxer(&self, output: &Path) -> Result<Box<dyn Muxer>, CodecError> {
        Ok(Box::new(crate::codec::ffmpeg::Mp4Muxer::create(output)?))
    }
}

/// Shared stop flag, checked once per loop iteration
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Segmentation mode shared with other threads, read once per frame
#[derive(Debug, Clone)]
pub struct ModeSwitch(Arc<AtomicU8>);

impl ModeSwitch {
    fn new(mode: SegmentationMode) -> Self {
        Self(Arc::new(AtomicU8::new(Self::encode(mode))))
    }

    fn encode(mode: SegmentationMode) -> u8 {
        match mode {
            SegmentationMode::AllObjects => 0,
            SegmentationMode::PersonOnly => 1,
        }
    }

    pub fn set(&self, mode: SegmentationMode) {
        self.0.store(Self::encode(mode), Ordering::SeqCst);
    }

    pub fn get(&self) -> SegmentationMode {
        match self.0.load(Ordering::SeqCst) {
            0 => SegmentationMode::AllObjects,
            _ => SegmentationMode::PersonOnly,
        }
    }
}

/// Counters for a completed run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub frames_decoded: u64,
    pub frames_rendered: u64,
    pub frames_failed: u64,
    pub samples_muxed: u64,
    pub elapsed: Duration,
}

type CompositorFactory = Box<dyn Fn(CompositorSettings) -> Box<dyn Compositor> + Send>;

/// Replaces the background of a video with a solid color
pub struct VideoProcessor {
    config: ProcessorConfig,
    backend: Box<dyn MediaBackend>,
    engine: Option<SegmentationEngine>,
    compositor_factory: Option<CompositorFactory>,
    stage: PipelineStage,
    mode: ModeSwitch,
    cancel: CancelToken,
}

impl VideoProcessor {
    pub fn new(config: ProcessorConfig, backend: Box<dyn MediaBackend>) -> Result<Self> {
        config.validate()?;
        let mode = ModeSwitch::new(config.mode);
        Ok(Self {
            config,
            backend,
            engine: None,
            compositor_factory: None,
            stage: PipelineStage::Idle,
            mode,
            cancel: CancelToken::new(),
        })
    }

    /// Processor with an already-built segmentation engine; no `initialize` needed
    pub fn with_engine(config: ProcessorConfig, backend: Box<dyn MediaBackend>, engine: SegmentationEngine) -> Result<Self> {
        let mut processor = Self::new(config, backend)?;
        processor.mode.set(engine.mode());
        processor.engine = Some(engine);
        Ok(processor)
    }

    /// Replace the compositor chosen from the config
    pub fn with_compositor_factory(
        mut self,
        factory: impl Fn(CompositorSettings) -> Box<dyn Compositor> + Send + 'static,
    ) -> Self {
        self.compositor_factory = Some(Box::new(factory));
        self
    }

    /// Load the segmentation models
    pub fn initialize(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        tracing::info!("Loading segmentation models");
        let mut engine = SegmentationEngine::from_config(&self.config)?;
        engine.set_mode(self.mode.get());
        for mode in [SegmentationMode::PersonOnly, SegmentationMode::AllObjects] {
            if !engine.has_strategy(mode) {
                tracing::warn!("No model configured for {} mode", mode);
            }
        }
        self.engine = Some(engine);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    /// Select the strategy used from the next frame on, also mid-run
    pub fn set_segmentation_mode(&mut self, mode: SegmentationMode) {
        self.mode.set(mode);
        self.config.mode = mode;
        if let Some(engine) = self.engine.as_mut() {
            engine.set_mode(mode);
        }
    }

    pub fn segmentation_mode(&self) -> SegmentationMode {
        self.mode.get()
    }

    /// Handle for switching mode from another thread during a run
    pub fn mode_switch(&self) -> ModeSwitch {
        self.mode.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn make_compositor(&self) -> Box<dyn Compositor> {
        let settings = CompositorSettings {
            background: self.config.background,
            show_matte: self.config.show_matte,
        };
        match &self.compositor_factory {
            Some(factory) => factory(settings),
            None if self.config.cpu_composite => Box::new(CpuCompositor::new(settings)),
            None => Box::new(WgpuCompositor::new(settings)),
        }
    }

    /// Process `input` into an H.264/MP4 file at `output`
    ///
    /// `on_progress` receives non-decreasing fractions in [0, 1]; `on_debug`
    /// receives diagnostics, at least one per run. Resources are released on
    /// every exit path, including cancellation.
    pub fn process_video(
        &mut self,
        input: &Path,
        output: &Path,
        on_progress: &mut dyn FnMut(f32),
        on_debug: &mut dyn FnMut(&str),
    ) -> Result<RunSummary> {
        if self.engine.is_none() {
            return Err(PipelineError::NotInitialized);
        }
        if self.stage.is_terminal() {
            self.stage.transition_to(PipelineStage::Idle)?;
        }

        let compositor = self.make_compositor();
        let Some(engine) = self.engine.as_mut() else {
            return Err(PipelineError::NotInitialized);
        };
        // Smoothing and timestamps never leak from one video into the next
        engine.reset_state();

        tracing::info!("Processing {} -> {}", input.display(), output.display());
        let result = run::FrameLoop {
            config: &self.config,
            backend: self.backend.as_ref(),
            engine,
            mode: &self.mode,
            cancel: &self.cancel,
            stage: &mut self.stage,
            on_progress,
            on_debug,
        }
        .execute(input, output, compositor);

        self.cancel.reset();
        match &result {
            Ok(summary) => tracing::info!(
                "Finished: {} frames decoded, {} rendered, {} failed, {} samples muxed in {:.1}s",
                summary.frames_decoded,
                summary.frames_rendered,
                summary.frames_failed,
                summary.samples_muxed,
                summary.elapsed.as_secs_f64()
            ),
            Err(e) => {
                tracing::error!("Processing failed: {}", e);
                if !self.stage.is_terminal() {
                    self.stage = PipelineStage::Failed;
                }
            }
        }
        result
    }

    /// Drop the loaded models; `initialize` must be called again before the next run
    pub fn release(&mut self) {
        if self.engine.take().is_some() {
            tracing::info!("Segmentation models released");
        }
    }
}

/// A processing run on a background thread
pub struct ProcessingHandle {
    cancel: CancelToken,
    mode: ModeSwitch,
    thread: JoinHandle<Result<RunSummary>>,
}

impl ProcessingHandle {
    /// Ask the run to stop; it unwinds through the normal cleanup path
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn set_segmentation_mode(&self, mode: SegmentationMode) {
        self.mode.set(mode);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> Result<RunSummary> {
        self.thread.join().map_err(|_| PipelineError::WorkerPanicked)?
    }
}

/// Run `processor` on a dedicated worker thread
///
/// The worker initializes the processor if needed, runs once and releases it.
pub fn spawn_processing(
    mut processor: VideoProcessor,
    input: PathBuf,
    output: PathBuf,
    mut on_progress: impl FnMut(f32) + Send + 'static,
    mut on_debug: impl FnMut(&str) + Send + 'static,
) -> Result<ProcessingHandle> {
    let cancel = processor.cancel_token();
    let mode = processor.mode_switch();

    let thread = thread::Builder::new()
        .name("backdrop-worker".to_string())
        .spawn(move || {
            processor.initialize()?;
            let result = processor.process_video(&input, &output, &mut on_progress, &mut on_debug);
            processor.release();
            result
        })
        .map_err(PipelineError::Spawn)?;

    Ok(ProcessingHandle { cancel, mode, thread })
}
