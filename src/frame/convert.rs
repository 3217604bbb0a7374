use image::{Rgb, RgbImage};

use super::{SegmentationMask, YuvFrame};
use crate::error::FrameError;

/// Black level of limited-range luma (16/255)
pub const LUMA_OFFSET: f32 = 16.0 / 255.0;

/// Chroma is centered at 0.5 after normalization (128/255 ≈ 0.502)
pub const CHROMA_OFFSET: f32 = 0.5;

/// ITU-R BT.601 limited-range YUV to RGB. The GPU shader uses the same coefficients.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32 / 255.0 - LUMA_OFFSET;
    let u = u as f32 / 255.0 - CHROMA_OFFSET;
    let v = v as f32 / 255.0 - CHROMA_OFFSET;

    let r = 1.164 * y + 1.596 * v;
    let g = 1.164 * y - 0.392 * u - 0.813 * v;
    let b = 1.164 * y + 2.017 * u;

    [to_u8(r), to_u8(g), to_u8(b)]
}

#[inline]
fn to_u8(c: f32) -> u8 {
    (c * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Convert a decoded frame to RGB for the segmentation models
pub fn frame_to_rgb(frame: &YuvFrame) -> Result<RgbImage, FrameError> {
    let _span = tracing::debug_span!("yuv_to_rgb").entered();

    let (w, h) = (frame.width as usize, frame.height as usize);
    let (cw, ch) = frame.chroma_size();
    frame.y.check_bounds("Y", w, h)?;
    frame.u.check_bounds("U", cw as usize, ch as usize)?;
    frame.v.check_bounds("V", cw as usize, ch as usize)?;

    // Odd dimensions: the last row/column reuses the last chroma sample
    let max_cx = (cw as usize).saturating_sub(1);
    let max_cy = (ch as usize).saturating_sub(1);

    let mut image = RgbImage::new(frame.width, frame.height);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let (x, y) = (x as usize, y as usize);
        let luma = frame.y.sample(x, y);
        let (cx, cy) = ((x / 2).min(max_cx), (y / 2).min(max_cy));
        let (u, v) = if cw == 0 || ch == 0 {
            (128, 128)
        } else {
            (frame.u.sample(cx, cy), frame.v.sample(cx, cy))
        };
        *pixel = Rgb(yuv_to_rgb(luma, u, v));
    }
    Ok(image)
}

/// Bilinear mask resize, sampling texel centers like a GPU linear sampler with clamp-to-edge
pub fn resize_mask_bilinear(mask: &SegmentationMask, width: u32, height: u32) -> SegmentationMask {
    if mask.width == width && mask.height == height {
        return mask.clone();
    }
    if mask.is_empty() || width == 0 || height == 0 {
        return SegmentationMask::zeros(width, height);
    }

    let (sw, sh) = (mask.width as usize, mask.height as usize);
    let x_ratio = mask.width as f32 / width as f32;
    let y_ratio = mask.height as f32 / height as f32;

    let mut values = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        let sy = ((y as f32 + 0.5) * y_ratio - 0.5).max(0.0);
        let y0 = (sy as usize).min(sh - 1);
        let y1 = (y0 + 1).min(sh - 1);
        let dy = sy - y0 as f32;
        for x in 0..width {
            let sx = ((x as f32 + 0.5) * x_ratio - 0.5).max(0.0);
            let x0 = (sx as usize).min(sw - 1);
            let x1 = (x0 + 1).min(sw - 1);
            let dx = sx - x0 as f32;

            let v00 = mask.values[y0 * sw + x0];
            let v10 = mask.values[y0 * sw + x1];
            let v01 = mask.values[y1 * sw + x0];
            let v11 = mask.values[y1 * sw + x1];

            let top = v00 * (1.0 - dx) + v10 * dx;
            let bottom = v01 * (1.0 - dx) + v11 * dx;
            values.push((top * (1.0 - dy) + bottom * dy).clamp(0.0, 1.0));
        }
    }
    SegmentationMask::new(width, height, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Plane;

    fn uniform_frame(width: u32, height: u32, y: u8, u: u8, v: u8) -> YuvFrame {
        let (cw, ch) = ((width / 2) as usize, (height / 2) as usize);
        YuvFrame {
            width,
            height,
            y: Plane::packed(vec![y; (width * height) as usize], width as usize),
            u: Plane::packed(vec![u; cw * ch], cw),
            v: Plane::packed(vec![v; cw * ch], cw),
            pts_us: 0,
        }
    }

    #[test]
    fn test_white_converts_to_255() {
        let [r, g, b] = yuv_to_rgb(235, 128, 128);
        for c in [r, g, b] {
            assert!(c >= 253, "channel {c} not white");
        }
    }

    #[test]
    fn test_neutral_chroma_gives_gray() {
        for luma in [16u8, 60, 126, 200, 235] {
            let [r, g, b] = yuv_to_rgb(luma, 128, 128);
            let (lo, hi) = (r.min(g).min(b), r.max(g).max(b));
            // 128 sits 1/510 above the 0.5 center, worth under two levels after the matrix
            assert!(hi - lo <= 2, "luma {luma}: ({r}, {g}, {b}) not gray");
        }
    }

    #[test]
    fn test_black_converts_to_zero() {
        let [r, g, b] = yuv_to_rgb(16, 128, 128);
        for c in [r, g, b] {
            assert!(c <= 2, "channel {c} not black");
        }
    }

    #[test]
    fn test_red_dominates_for_high_v() {
        let [r, g, b] = yuv_to_rgb(81, 90, 240);
        assert!(r > 240);
        assert!(g < 20);
        assert!(b < 20);
    }

    #[test]
    fn test_frame_to_rgb_uniform() {
        let frame = uniform_frame(4, 4, 235, 128, 128);
        let image = frame_to_rgb(&frame).unwrap();
        assert_eq!(image.dimensions(), (4, 4));
        assert!(image.pixels().all(|p| p.0.iter().all(|&c| c >= 253)));
    }

    #[test]
    fn test_frame_to_rgb_odd_dimensions() {
        let frame = uniform_frame(5, 3, 16, 128, 128);
        let image = frame_to_rgb(&frame).unwrap();
        assert_eq!(image.dimensions(), (5, 3));
    }

    #[test]
    fn test_frame_to_rgb_reports_bad_plane() {
        let mut frame = uniform_frame(4, 4, 100, 128, 128);
        frame.u = Plane::packed(vec![128u8; 2], 2);
        assert!(frame_to_rgb(&frame).is_err());
    }

    #[test]
    fn test_resize_mask_identity_and_range() {
        let mask = SegmentationMask::new(2, 2, vec![0.0, 1.0, 1.0, 0.0]);
        assert_eq!(resize_mask_bilinear(&mask, 2, 2), mask);

        let up = resize_mask_bilinear(&mask, 8, 8);
        assert_eq!(up.len(), 64);
        assert!(up.values.iter().all(|v| (0.0..=1.0).contains(v)));
        // Corners keep the source values under clamp-to-edge
        assert_eq!(up.values[0], 0.0);
        assert_eq!(up.values[7], 1.0);
    }
}
