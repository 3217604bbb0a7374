//! Morphological close (dilate then erode) for filling holes in masks.
//! Optional post-process, disabled unless a kernel size is configured.
//!
//! The square window is split into a row pass and a column pass, so each
//! pass costs O(n·r) instead of O(n·r²). Windows are clamped at the edges.

use crate::frame::SegmentationMask;

/// Dilate then erode with a square `kernel_size` window
pub fn close(mask: &SegmentationMask, kernel_size: u32) -> SegmentationMask {
    let radius = (kernel_size / 2) as usize;
    if radius == 0 || mask.is_empty() {
        return mask.clone();
    }
    erode(&dilate(mask, radius), radius)
}

/// Separable max filter: horizontal pass into a scratch buffer, then vertical
pub fn dilate(mask: &SegmentationMask, radius: usize) -> SegmentationMask {
    let (w, h) = (mask.width as usize, mask.height as usize);
    if radius == 0 || mask.is_empty() {
        return mask.clone();
    }

    let mut temp = vec![0.0; w * h];
    for (src, dst) in mask.values.chunks_exact(w).zip(temp.chunks_exact_mut(w)) {
        for (x, out) in dst.iter_mut().enumerate() {
            *out = window_max(x, w, radius, |i| src[i]);
        }
    }

    let mut values = vec![0.0; w * h];
    for x in 0..w {
        for y in 0..h {
            values[y * w + x] = window_max(y, h, radius, |i| temp[i * w + x]);
        }
    }
    SegmentationMask::new(mask.width, mask.height, values)
}

/// Erosion as the complement of dilating the complement
pub fn erode(mask: &SegmentationMask, radius: usize) -> SegmentationMask {
    let mut dilated = dilate(&complement(mask), radius);
    for v in &mut dilated.values {
        *v = 1.0 - *v;
    }
    dilated
}

fn complement(mask: &SegmentationMask) -> SegmentationMask {
    let values = mask.values.iter().map(|v| 1.0 - v).collect();
    SegmentationMask::new(mask.width, mask.height, values)
}

#[inline]
fn window_max(center: usize, len: usize, radius: usize, sample: impl Fn(usize) -> f32) -> f32 {
    let lo = center.saturating_sub(radius);
    let hi = (center + radius).min(len - 1);
    (lo..=hi).map(sample).fold(f32::NEG_INFINITY, f32::max)
}
