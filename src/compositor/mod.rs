//! Final frame compositing
//!
//! A compositor takes the three packed YUV planes of a frame plus its mask,
//! converts to RGB, replaces the background and presents the result to the
//! encoder surface with the frame's timestamp.

mod cpu;
mod gpu;

pub use cpu::CpuCompositor;
pub use gpu::WgpuCompositor;

use crate::codec::EncoderSurface;
use crate::config::BackgroundColor;
use crate::error::CompositorError;
use crate::frame::{PackedPlanes, SegmentationMask};

/// What a compositor draws
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositorSettings {
    pub background: BackgroundColor,
    /// Draw the mask itself as grayscale instead of the composited frame
    pub show_matte: bool,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            background: BackgroundColor::WHITE,
            show_matte: false,
        }
    }
}

/// Renders composited frames into an encoder surface
///
/// Every error is fatal for the current run. Resources are freed exactly once
/// by `release`, which is safe to call repeatedly.
pub trait Compositor {
    /// Bind to the calling thread and allocate resources for `width x height` frames
    fn initialize(&mut self, width: u32, height: u32, surface: EncoderSurface) -> Result<(), CompositorError>;

    /// Composite one frame and present it with `timestamp_us`
    ///
    /// Must be called from the thread that called `initialize`.
    fn render_frame(
        &mut self,
        planes: &PackedPlanes,
        mask: &SegmentationMask,
        timestamp_us: i64,
    ) -> Result<(), CompositorError>;

    fn release(&mut self);

    fn name(&self) -> &'static str;
}

pub(crate) fn check_planes(planes: &PackedPlanes, width: u32, height: u32) -> Result<(), CompositorError> {
    let luma = (width * height) as usize;
    let (cw, ch) = planes.chroma_size();
    let chroma = (cw * ch) as usize;
    if planes.width != width || planes.height != height || planes.y.len() != luma {
        return Err(CompositorError::PlaneSize {
            plane: "Y",
            expected: luma,
            actual: planes.y.len(),
        });
    }
    for (plane, data) in [("U", &planes.u), ("V", &planes.v)] {
        if data.len() != chroma {
            return Err(CompositorError::PlaneSize {
                plane,
                expected: chroma,
                actual: data.len(),
            });
        }
    }
    Ok(())
}

pub(crate) fn check_mask(mask: &SegmentationMask) -> Result<(), CompositorError> {
    if mask.width == 0 || mask.height == 0 || mask.len() != (mask.width * mask.height) as usize {
        return Err(CompositorError::MaskSize {
            width: mask.width,
            height: mask.height,
            actual: mask.len(),
        });
    }
    Ok(())
}
