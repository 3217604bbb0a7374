use std::time::Instant;

use image::RgbImage;
use ndarray::ArrayD;

use super::backend::InferenceBackend;
use super::preprocess::{Preprocessor, TensorLayout};
use super::temporal::PipelineState;
use super::types::{SegmentationMode, SegmentationOutput, SegmentationStrategy};
use crate::error::SegmentationError;
use crate::frame::SegmentationMask;

/// Person-only segmentation (selfie segmentation style model)
///
/// The model itself is run in a temporally-aware fashion and needs strictly
/// increasing timestamps; an extra EMA stage smooths the confidence map further.
pub struct PersonSegmenter {
    backend: Box<dyn InferenceBackend>,
    preprocessor: Preprocessor,
    layout: TensorLayout,
    state: PipelineState,
    /// Size of the last mask produced, used for the empty fallback
    output_size: (u32, u32),
}

impl PersonSegmenter {
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        input_size: (u32, u32),
        layout: TensorLayout,
        ema_alpha: f32,
    ) -> Self {
        Self {
            backend,
            preprocessor: Preprocessor::new(input_size.0, input_size.1, layout),
            layout,
            state: PipelineState::new(ema_alpha),
            output_size: input_size,
        }
    }

    pub fn set_ema_alpha(&mut self, alpha: f32) {
        self.state.filter.set_alpha(alpha);
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Extract the person confidence plane from the model output
    fn decode_output(&self, output: &ArrayD<f32>) -> Result<SegmentationMask, SegmentationError> {
        let shape = output.shape().to_vec();
        // 3D outputs are [1, H, W] or [H, W, 1]; the layout breaks the [1, N, 1] tie
        let trailing_channel =
            shape.len() == 3 && shape[2] == 1 && (shape[0] != 1 || self.layout == TensorLayout::Nhwc);
        let (height, width, channels) = match shape.len() {
            4 => self.layout.split_shape(&shape).ok_or_else(|| SegmentationError::OutputShape {
                shape: shape.clone(),
                reason: "expected a 4D tensor".to_string(),
            })?,
            3 if trailing_channel => (shape[0], shape[1], 1),
            3 if shape[0] == 1 => (shape[1], shape[2], 1),
            3 => {
                return Err(SegmentationError::OutputShape {
                    shape,
                    reason: "expected [1, H, W] or [H, W, 1]".to_string(),
                })
            }
            2 => (shape[0], shape[1], 1),
            _ => {
                return Err(SegmentationError::OutputShape {
                    shape,
                    reason: "expected a 2D, 3D or 4D tensor".to_string(),
                })
            }
        };

        // Two-channel models emit (background, person)
        let channel = match channels {
            1 => 0,
            2 => 1,
            _ => {
                return Err(SegmentationError::OutputShape {
                    shape,
                    reason: format!("expected 1 or 2 channels, got {channels}"),
                })
            }
        };

        let mut values = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let v = match (shape.len(), self.layout) {
                    (4, TensorLayout::Nhwc) => output[[0, y, x, channel]],
                    (4, TensorLayout::Nchw) => output[[0, channel, y, x]],
                    (3, _) if trailing_channel => output[[y, x, 0]],
                    (3, _) => output[[0, y, x]],
                    _ => output[[y, x]],
                };
                values.push(v);
            }
        }

        let mut mask = SegmentationMask::new(width as u32, height as u32, values);
        mask.clamp();
        Ok(mask)
    }
}

impl SegmentationStrategy for PersonSegmenter {
    fn segment(&mut self, frame: &RgbImage, timestamp_us: i64) -> Result<SegmentationOutput, SegmentationError> {
        let _span = tracing::debug_span!("person_segment").entered();
        let start = Instant::now();

        let timestamp = self.state.timestamps.next(timestamp_us);

        let input = self.preprocessor.preprocess(frame);
        let Some(output) = self.backend.run(input)? else {
            let (w, h) = self.output_size;
            tracing::error!("Person segmentation returned no output at {}us", timestamp);
            return Ok(SegmentationOutput {
                mask: SegmentationMask::zeros(w, h),
                debug_info: "Error: null result".to_string(),
            });
        };

        let current = self.decode_output(&output)?;
        self.output_size = (current.width, current.height);
        let smoothed = self.state.filter.apply(current);

        let inference_ms = start.elapsed().as_secs_f64() * 1000.0;
        let foreground = smoothed.foreground_pixels();
        let ratio = smoothed.foreground_ratio();

        tracing::debug!(
            "Person segmentation: {:.1}ms, foreground {}/{} ({:.2}%), alpha {}, timestamp {}us",
            inference_ms,
            foreground,
            smoothed.len(),
            ratio,
            self.state.filter.alpha(),
            timestamp
        );

        let debug_info = format!(
            "=== Person segmentation ({}) ===\ninference: {:.1}ms\nforeground: {}/{} ({:.2}%)\nEMA alpha: {}\n",
            self.backend.name(),
            inference_ms,
            foreground,
            smoothed.len(),
            ratio,
            self.state.filter.alpha()
        );

        Ok(SegmentationOutput {
            mask: smoothed,
            debug_info,
        })
    }

    fn reset_state(&mut self) {
        tracing::info!("Resetting person segmentation state (EMA filter and timestamps)");
        self.state.reset();
    }

    fn input_size(&self) -> (u32, u32) {
        self.preprocessor.target_size()
    }

    fn mode(&self) -> SegmentationMode {
        SegmentationMode::PersonOnly
    }
}
