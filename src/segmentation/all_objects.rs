use std::collections::HashMap;
use std::time::Instant;

use image::RgbImage;
use ndarray::ArrayD;

use super::backend::InferenceBackend;
use super::preprocess::{Preprocessor, TensorLayout};
use super::types::{SegmentationMode, SegmentationOutput, SegmentationStrategy};
use crate::error::SegmentationError;
use crate::frame::SegmentationMask;

/// Class index treated as background
pub const BACKGROUND_CLASS: usize = 0;

/// All-object segmentation with a multi-class (DeepLab style) model
///
/// Every pixel whose argmax class is not the background class is kept.
/// The mask is binary and never smoothed.
pub struct AllObjectsSegmenter {
    backend: Box<dyn InferenceBackend>,
    preprocessor: Preprocessor,
    layout: TensorLayout,
    output_size: (u32, u32),
}

/// Argmax result for one inference
struct ClassMap {
    mask: SegmentationMask,
    class_counts: HashMap<usize, usize>,
}

impl AllObjectsSegmenter {
    pub fn new(backend: Box<dyn InferenceBackend>, input_size: (u32, u32), layout: TensorLayout) -> Self {
        Self {
            backend,
            preprocessor: Preprocessor::new(input_size.0, input_size.1, layout),
            layout,
            output_size: input_size,
        }
    }

    /// Per-pixel argmax over the class axis
    fn argmax(&self, output: &ArrayD<f32>) -> Result<ClassMap, SegmentationError> {
        let shape = output.shape().to_vec();
        let (height, width, classes) =
            self.layout
                .split_shape(&shape)
                .ok_or_else(|| SegmentationError::OutputShape {
                    shape: shape.clone(),
                    reason: "expected a 4D class score tensor".to_string(),
                })?;
        if classes == 0 {
            return Err(SegmentationError::OutputShape {
                shape,
                reason: "no classes".to_string(),
            });
        }

        let mut values = Vec::with_capacity(width * height);
        let mut class_counts = HashMap::new();
        for y in 0..height {
            for x in 0..width {
                let mut best_class = BACKGROUND_CLASS;
                let mut best_score = f32::NEG_INFINITY;
                for c in 0..classes {
                    let score = match self.layout {
                        TensorLayout::Nhwc => output[[0, y, x, c]],
                        TensorLayout::Nchw => output[[0, c, y, x]],
                    };
                    if score > best_score {
                        best_score = score;
                        best_class = c;
                    }
                }
                *class_counts.entry(best_class).or_insert(0) += 1;
                values.push(if best_class != BACKGROUND_CLASS { 1.0 } else { 0.0 });
            }
        }

        Ok(ClassMap {
            mask: SegmentationMask::new(width as u32, height as u32, values),
            class_counts,
        })
    }
}

impl SegmentationStrategy for AllObjectsSegmenter {
    fn segment(&mut self, frame: &RgbImage, _timestamp_us: i64) -> Result<SegmentationOutput, SegmentationError> {
        let _span = tracing::debug_span!("all_objects_segment").entered();
        let start = Instant::now();

        let input = self.preprocessor.preprocess(frame);
        let Some(output) = self.backend.run(input)? else {
            let (w, h) = self.output_size;
            tracing::error!("All-objects segmentation returned no output");
            return Ok(SegmentationOutput {
                mask: SegmentationMask::zeros(w, h),
                debug_info: "Error: null result".to_string(),
            });
        };

        let ClassMap { mask, class_counts } = self.argmax(&output)?;
        self.output_size = (mask.width, mask.height);

        let inference_ms = start.elapsed().as_secs_f64() * 1000.0;
        let mut top: Vec<(usize, usize)> = class_counts.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top.truncate(5);

        let foreground = mask.foreground_pixels();
        let ratio = mask.foreground_ratio();

        tracing::debug!(
            "All-objects segmentation: {:.1}ms, top classes {:?}, foreground {}/{} ({:.2}%)",
            inference_ms,
            top,
            foreground,
            mask.len(),
            ratio
        );

        let top_text = top
            .iter()
            .map(|(class, count)| format!("{class}:{count}"))
            .collect::<Vec<_>>()
            .join(", ");
        let debug_info = format!(
            "=== All-objects segmentation ({}) ===\ninference: {:.1}ms\ntop classes: [{}]\nforeground: {}/{} ({:.2}%)\n",
            self.backend.name(),
            inference_ms,
            top_text,
            foreground,
            mask.len(),
            ratio
        );

        Ok(SegmentationOutput { mask, debug_info })
    }

    fn input_size(&self) -> (u32, u32) {
        self.preprocessor.target_size()
    }

    fn mode(&self) -> SegmentationMode {
        SegmentationMode::AllObjects
    }
}
