//! Decoded frame and mask representations
//!
//! Decoders hand out planar YUV 4:2:0 frames whose planes keep the decoder's
//! memory layout: rows may be padded (`row_stride > width`) and samples may be
//! interleaved with another plane (`pixel_stride > 1`, e.g. NV12 chroma).

mod convert;

pub use convert::{frame_to_rgb, resize_mask_bilinear, yuv_to_rgb, CHROMA_OFFSET, LUMA_OFFSET};

use bytes::Bytes;

use crate::error::FrameError;

/// One color plane with its stride layout
#[derive(Debug, Clone)]
pub struct Plane {
    /// Backing bytes, possibly shared with another plane
    pub data: Bytes,
    /// Bytes between the start of consecutive rows
    pub row_stride: usize,
    /// Bytes between consecutive samples in a row
    pub pixel_stride: usize,
}

impl Plane {
    /// Tightly packed plane (row stride == width, pixel stride == 1)
    pub fn packed(data: impl Into<Bytes>, width: usize) -> Self {
        Self {
            data: data.into(),
            row_stride: width,
            pixel_stride: 1,
        }
    }

    /// Sample at column `x`, row `y`
    #[inline]
    pub fn sample(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.row_stride + x * self.pixel_stride]
    }

    /// Check that a `width x height` region is addressable
    pub fn check_bounds(&self, name: &'static str, width: usize, height: usize) -> Result<(), FrameError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        if self.pixel_stride == 0 {
            return Err(FrameError::PlaneExtraction {
                plane: name,
                reason: "pixel stride is zero".to_string(),
            });
        }
        if self.row_stride < (width - 1) * self.pixel_stride + 1 {
            return Err(FrameError::PlaneExtraction {
                plane: name,
                reason: format!(
                    "row stride {} too small for {} samples at pixel stride {}",
                    self.row_stride, width, self.pixel_stride
                ),
            });
        }
        let last = (height - 1) * self.row_stride + (width - 1) * self.pixel_stride;
        if last >= self.data.len() {
            return Err(FrameError::PlaneExtraction {
                plane: name,
                reason: format!(
                    "buffer of {} bytes too small for {}x{} (needs {})",
                    self.data.len(),
                    width,
                    height,
                    last + 1
                ),
            });
        }
        Ok(())
    }

    /// Copy the `width x height` region into a tightly packed buffer
    pub fn pack(&self, name: &'static str, width: usize, height: usize) -> Result<Vec<u8>, FrameError> {
        self.check_bounds(name, width, height)?;
        let mut out = Vec::with_capacity(width * height);
        if self.pixel_stride == 1 {
            for row in 0..height {
                let start = row * self.row_stride;
                out.extend_from_slice(&self.data[start..start + width]);
            }
        } else {
            for row in 0..height {
                for col in 0..width {
                    out.push(self.sample(col, row));
                }
            }
        }
        Ok(out)
    }
}

/// A decoded YUV 4:2:0 frame
#[derive(Debug, Clone)]
pub struct YuvFrame {
    pub width: u32,
    pub height: u32,
    pub y: Plane,
    pub u: Plane,
    pub v: Plane,
    /// Presentation timestamp in microseconds
    pub pts_us: i64,
}

impl YuvFrame {
    pub fn chroma_size(&self) -> (u32, u32) {
        (self.width / 2, self.height / 2)
    }

    /// Extract all three planes into packed buffers for texture upload
    pub fn pack_planes(&self) -> Result<PackedPlanes, FrameError> {
        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = self.chroma_size();
        let (cw, ch) = (cw as usize, ch as usize);
        Ok(PackedPlanes {
            width: self.width,
            height: self.height,
            y: self.y.pack("Y", w, h)?,
            u: self.u.pack("U", cw, ch)?,
            v: self.v.pack("V", cw, ch)?,
        })
    }

    /// Short human-readable description of the plane layout
    pub fn layout_summary(&self) -> String {
        format!(
            "frame {}x{}\nY: stride={}, pixel={}, buf={}\nU: stride={}, pixel={}, buf={}\nV: stride={}, pixel={}, buf={}",
            self.width,
            self.height,
            self.y.row_stride,
            self.y.pixel_stride,
            self.y.data.len(),
            self.u.row_stride,
            self.u.pixel_stride,
            self.u.data.len(),
            self.v.row_stride,
            self.v.pixel_stride,
            self.v.data.len(),
        )
    }
}

/// Tightly packed Y, U and V planes (U and V at half resolution)
#[derive(Debug, Clone, PartialEq)]
pub struct PackedPlanes {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl PackedPlanes {
    pub fn chroma_size(&self) -> (u32, u32) {
        (self.width / 2, self.height / 2)
    }
}

/// Per-pixel foreground confidence in [0.0, 1.0], row-major
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

impl SegmentationMask {
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Self {
        debug_assert_eq!(values.len(), (width * height) as usize);
        Self {
            width,
            height,
            values,
        }
    }

    /// All-background mask
    pub fn zeros(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![0.0; (width * height) as usize])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn same_size(&self, other: &SegmentationMask) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Clamp every value into [0, 1]; NaN becomes background
    pub fn clamp(&mut self) {
        for v in &mut self.values {
            *v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        }
    }

    /// Number of values above 0.5
    pub fn foreground_pixels(&self) -> usize {
        self.values.iter().filter(|&&v| v > 0.5).count()
    }

    /// Foreground share in percent
    pub fn foreground_ratio(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.foreground_pixels() as f32 / self.values.len() as f32 * 100.0
    }
}
