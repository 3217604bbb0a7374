use std::fmt;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::SegmentationError;
use crate::frame::SegmentationMask;

/// Which segmentation strategy the pipeline uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentationMode {
    /// Multi-class model, everything that is not class 0 is foreground
    AllObjects,
    /// Single-class person confidence with temporal smoothing
    PersonOnly,
}

impl fmt::Display for SegmentationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentationMode::AllObjects => write!(f, "all-objects"),
            SegmentationMode::PersonOnly => write!(f, "person-only"),
        }
    }
}

/// Mask produced for one frame plus a diagnostic label
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    pub mask: SegmentationMask,
    /// Human-readable inference summary (timing, mask statistics)
    pub debug_info: String,
}

/// A segmentation strategy wrapping one pretrained model
///
/// Implementations resize the frame to their model resolution themselves, so
/// callers can pass full-resolution frames.
pub trait SegmentationStrategy: Send {
    /// Produce a confidence mask for `frame`
    ///
    /// # Arguments
    /// * `frame` - Full-resolution RGB frame
    /// * `timestamp_us` - Presentation timestamp; temporally-aware strategies
    ///   require these to increase strictly and enforce it themselves
    ///
    /// # Returns
    /// * Mask at the model's output resolution, values within [0.0, 1.0]
    fn segment(&mut self, frame: &RgbImage, timestamp_us: i64) -> Result<SegmentationOutput, SegmentationError>;

    /// Reset temporal state. Call once at the start of every run, never mid-run.
    fn reset_state(&mut self) {
        // Default implementation: no-op for stateless models
    }

    /// Model input dimensions as (width, height)
    fn input_size(&self) -> (u32, u32);

    fn mode(&self) -> SegmentationMode;
}
