use image::{imageops, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

/// Memory layout of a 4D image tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorLayout {
    /// [batch, height, width, channels]
    Nhwc,
    /// [batch, channels, height, width]
    Nchw,
}

impl TensorLayout {
    /// (height, width, channels) of a 4D tensor shape in this layout
    pub fn split_shape(self, shape: &[usize]) -> Option<(usize, usize, usize)> {
        if shape.len() != 4 {
            return None;
        }
        Some(match self {
            TensorLayout::Nhwc => (shape[1], shape[2], shape[3]),
            TensorLayout::Nchw => (shape[2], shape[3], shape[1]),
        })
    }
}

/// Preprocessor for converting RGB images to model input tensors
#[derive(Debug, Clone)]
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
    layout: TensorLayout,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32, layout: TensorLayout) -> Self {
        Self {
            target_width,
            target_height,
            layout,
        }
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }

    /// Resize to the model resolution with bilinear filtering
    pub fn resize(&self, image: &RgbImage) -> RgbImage {
        if image.dimensions() == (self.target_width, self.target_height) {
            return image.clone();
        }
        imageops::resize(
            image,
            self.target_width,
            self.target_height,
            imageops::FilterType::Triangle,
        )
    }

    /// Preprocess an RGB image into a normalized tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions
    /// 2. Convert to float and normalize to [0, 1]
    /// 3. Lay out as NHWC or NCHW
    pub fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized = self.resize(image);
        let (width, height) = resized.dimensions();
        let (w, h) = (width as usize, height as usize);

        let mut tensor = match self.layout {
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
        };

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                match self.layout {
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                }
            }
        }

        tensor
    }
}
