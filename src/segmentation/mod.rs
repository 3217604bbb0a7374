mod all_objects;
mod backend;
pub mod morphology;
mod person;
mod preprocess;
pub mod temporal;
pub mod types;

pub use all_objects::{AllObjectsSegmenter, BACKGROUND_CLASS};
pub use backend::{InferenceBackend, OrtBackend};
pub use person::PersonSegmenter;
pub use preprocess::{Preprocessor, TensorLayout};
pub use temporal::{MonotonicTimestamps, PipelineState, TemporalMaskFilter};
pub use types::{SegmentationMode, SegmentationOutput, SegmentationStrategy};

use image::RgbImage;

use crate::config::ProcessorConfig;
use crate::error::SegmentationError;

/// Holds one strategy per mode and dispatches to the active one
///
/// Switching mode only changes which strategy is called; each strategy keeps
/// its own state.
pub struct SegmentationEngine {
    mode: SegmentationMode,
    all_objects: Option<Box<dyn SegmentationStrategy>>,
    person: Option<Box<dyn SegmentationStrategy>>,
    hole_fill_kernel: Option<u32>,
}

impl SegmentationEngine {
    pub fn new(mode: SegmentationMode) -> Self {
        Self {
            mode,
            all_objects: None,
            person: None,
            hole_fill_kernel: None,
        }
    }

    /// Load the ONNX models named in `config`
    pub fn from_config(config: &ProcessorConfig) -> Result<Self, SegmentationError> {
        let mut engine = Self::new(config.mode).with_hole_fill(config.hole_fill_kernel);

        if let Some(path) = &config.person_model.path {
            let backend = OrtBackend::new(path)?;
            engine = engine.with_strategy(Box::new(PersonSegmenter::new(
                Box::new(backend),
                (config.person_model.input_width, config.person_model.input_height),
                config.person_model.layout,
                config.ema_alpha,
            )));
        }

        if let Some(path) = &config.objects_model.path {
            let backend = OrtBackend::new(path)?;
            engine = engine.with_strategy(Box::new(AllObjectsSegmenter::new(
                Box::new(backend),
                (config.objects_model.input_width, config.objects_model.input_height),
                config.objects_model.layout,
            )));
        }

        Ok(engine)
    }

    /// Install a strategy for the mode it reports
    pub fn with_strategy(mut self, strategy: Box<dyn SegmentationStrategy>) -> Self {
        match strategy.mode() {
            SegmentationMode::AllObjects => self.all_objects = Some(strategy),
            SegmentationMode::PersonOnly => self.person = Some(strategy),
        }
        self
    }

    pub fn with_hole_fill(mut self, kernel: Option<u32>) -> Self {
        self.hole_fill_kernel = kernel;
        self
    }

    pub fn mode(&self) -> SegmentationMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SegmentationMode) {
        if mode != self.mode {
            tracing::info!("Segmentation mode set to {}", mode);
        }
        self.mode = mode;
    }

    pub fn has_strategy(&self, mode: SegmentationMode) -> bool {
        self.strategy(mode).is_some()
    }

    fn strategy(&self, mode: SegmentationMode) -> Option<&dyn SegmentationStrategy> {
        match mode {
            SegmentationMode::AllObjects => self.all_objects.as_deref(),
            SegmentationMode::PersonOnly => self.person.as_deref(),
        }
    }

    fn strategy_mut(&mut self, mode: SegmentationMode) -> Option<&mut (dyn SegmentationStrategy + 'static)> {
        match mode {
            SegmentationMode::AllObjects => self.all_objects.as_deref_mut(),
            SegmentationMode::PersonOnly => self.person.as_deref_mut(),
        }
    }

    /// Segment with the active strategy
    pub fn segment(&mut self, frame: &RgbImage, timestamp_us: i64) -> Result<SegmentationOutput, SegmentationError> {
        let mode = self.mode;
        let kernel = self.hole_fill_kernel;
        let strategy = self
            .strategy_mut(mode)
            .ok_or(SegmentationError::StrategyUnavailable(mode))?;

        let mut output = strategy.segment(frame, timestamp_us)?;
        if let Some(kernel) = kernel {
            output.mask = morphology::close(&output.mask, kernel);
        }
        output.mask.clamp();
        Ok(output)
    }

    /// Reset every strategy's temporal state
    pub fn reset_state(&mut self) {
        for strategy in [self.all_objects.as_deref_mut(), self.person.as_deref_mut()]
            .into_iter()
            .flatten()
        {
            strategy.reset_state();
        }
    }
}
