use std::time::Instant;

use super::{check_mask, check_planes, Compositor, CompositorSettings};
use crate::codec::{EncoderSurface, SurfaceFrame};
use crate::error::CompositorError;
use crate::frame::{resize_mask_bilinear, PackedPlanes, SegmentationMask, CHROMA_OFFSET, LUMA_OFFSET};

/// Software compositor with the same math as `shader.wgsl`
///
/// Chroma is sampled nearest, the mask is upscaled bilinearly with texel-center
/// sampling like the GPU sampler.
pub struct CpuCompositor {
    settings: CompositorSettings,
    target: Option<Target>,
}

struct Target {
    width: u32,
    height: u32,
    surface: EncoderSurface,
}

impl CpuCompositor {
    pub fn new(settings: CompositorSettings) -> Self {
        Self { settings, target: None }
    }
}

/// One output pixel, mirroring `fs_main`
#[inline]
fn shade(y: u8, u: u8, v: u8, mask: f32, background: [f32; 3], show_matte: bool) -> [u8; 4] {
    let mask = mask.clamp(0.0, 1.0);
    let quantize = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    if show_matte {
        let m = quantize(mask);
        return [m, m, m, 255];
    }

    let y = y as f32 / 255.0 - LUMA_OFFSET;
    let u = u as f32 / 255.0 - CHROMA_OFFSET;
    let v = v as f32 / 255.0 - CHROMA_OFFSET;
    let rgb = [
        (1.164 * y + 1.596 * v).clamp(0.0, 1.0),
        (1.164 * y - 0.392 * u - 0.813 * v).clamp(0.0, 1.0),
        (1.164 * y + 2.017 * u).clamp(0.0, 1.0),
    ];

    let mix = |bg: f32, fg: f32| bg + (fg - bg) * mask;
    [
        quantize(mix(background[0], rgb[0])),
        quantize(mix(background[1], rgb[1])),
        quantize(mix(background[2], rgb[2])),
        255,
    ]
}

impl Compositor for CpuCompositor {
    fn initialize(&mut self, width: u32, height: u32, surface: EncoderSurface) -> Result<(), CompositorError> {
        self.target = Some(Target { width, height, surface });
        tracing::info!("CPU compositor initialized for {}x{}", width, height);
        Ok(())
    }

    fn render_frame(
        &mut self,
        planes: &PackedPlanes,
        mask: &SegmentationMask,
        timestamp_us: i64,
    ) -> Result<(), CompositorError> {
        let _span = tracing::debug_span!("composite_cpu").entered();
        let start = Instant::now();

        let target = self.target.as_ref().ok_or(CompositorError::NotInitialized)?;
        let (width, height) = (target.width, target.height);
        check_planes(planes, width, height)?;
        check_mask(mask)?;

        let scaled = resize_mask_bilinear(mask, width, height);
        let (cw, ch) = planes.chroma_size();
        let background = self.settings.background.0;

        let mut rgba = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height as usize {
            for x in 0..width as usize {
                let luma = planes.y[y * width as usize + x];
                let (u, v) = if cw == 0 || ch == 0 {
                    (128, 128)
                } else {
                    let cx = (x / 2).min(cw as usize - 1);
                    let cy = (y / 2).min(ch as usize - 1);
                    let i = cy * cw as usize + cx;
                    (planes.u[i], planes.v[i])
                };
                let m = scaled.values[y * width as usize + x];
                rgba.extend_from_slice(&shade(luma, u, v, m, background, self.settings.show_matte));
            }
        }

        target.surface.present(SurfaceFrame {
            width,
            height,
            rgba,
            timestamp_us,
        })?;

        tracing::trace!("CPU composite took {:.2}ms", start.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn release(&mut self) {
        if self.target.take().is_some() {
            tracing::debug!("CPU compositor released");
        }
    }

    fn name(&self) -> &'static str {
        "cpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackgroundColor;

    fn gray_planes(width: u32, height: u32, luma: u8) -> PackedPlanes {
        let chroma = ((width / 2) * (height / 2)) as usize;
        PackedPlanes {
            width,
            height,
            y: vec![luma; (width * height) as usize],
            u: vec![128; chroma],
            v: vec![128; chroma],
        }
    }

    fn render(settings: CompositorSettings, planes: &PackedPlanes, mask: &SegmentationMask) -> SurfaceFrame {
        let (surface, receiver) = EncoderSurface::channel(2);
        let mut compositor = CpuCompositor::new(settings);
        compositor.initialize(planes.width, planes.height, surface).unwrap();
        compositor.render_frame(planes, mask, 1234).unwrap();
        receiver.try_next().unwrap()
    }

    #[test]
    fn test_full_mask_keeps_pixels() {
        let frame = render(
            CompositorSettings::default(),
            &gray_planes(4, 4, 235),
            &SegmentationMask::new(1, 1, vec![1.0]),
        );
        assert_eq!(frame.timestamp_us, 1234);
        assert!(frame.rgba.chunks(4).all(|p| p[0] >= 253 && p[3] == 255));
    }

    #[test]
    fn test_empty_mask_shows_background() {
        let settings = CompositorSettings {
            background: BackgroundColor([0.0, 1.0, 0.0]),
            show_matte: false,
        };
        let frame = render(settings, &gray_planes(4, 2, 16), &SegmentationMask::zeros(2, 2));
        assert!(frame.rgba.chunks(4).all(|p| p == [0, 255, 0, 255]));
    }

    #[test]
    fn test_half_mask_blends() {
        let settings = CompositorSettings {
            background: BackgroundColor([1.0, 1.0, 1.0]),
            show_matte: false,
        };
        let frame = render(settings, &gray_planes(2, 2, 16), &SegmentationMask::new(1, 1, vec![0.5]));
        // black foreground mixed halfway toward white
        assert!(frame.rgba.chunks(4).all(|p| (127..=128).contains(&p[0])));
    }

    #[test]
    fn test_matte_preview() {
        let settings = CompositorSettings {
            background: BackgroundColor::WHITE,
            show_matte: true,
        };
        let frame = render(settings, &gray_planes(2, 2, 100), &SegmentationMask::new(2, 1, vec![0.0, 1.0]));
        assert_eq!(&frame.rgba[0..4], &[0, 0, 0, 255]);
        assert_eq!(&frame.rgba[4..8], &[255, 255, 255, 255]);
    }

    #[test]
    fn test_rejects_bad_planes_and_uninitialized() {
        let mut compositor = CpuCompositor::new(CompositorSettings::default());
        let planes = gray_planes(4, 4, 0);
        let mask = SegmentationMask::zeros(1, 1);
        assert!(matches!(
            compositor.render_frame(&planes, &mask, 0),
            Err(CompositorError::NotInitialized)
        ));

        let (surface, _receiver) = EncoderSurface::channel(1);
        compositor.initialize(8, 8, surface).unwrap();
        assert!(matches!(
            compositor.render_frame(&planes, &mask, 0),
            Err(CompositorError::PlaneSize { plane: "Y", .. })
        ));
    }
}
