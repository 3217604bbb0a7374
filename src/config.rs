//! Processor configuration
//!
//! Everything here has a sensible default so a run only needs model paths.
//! The encoder settings are fixed for the H.264/MP4 output and are not exposed
//! on the command line.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::segmentation::{SegmentationMode, TensorLayout};

/// Default EMA coefficient for the person strategy's extra smoothing stage
pub const DEFAULT_EMA_ALPHA: f32 = 0.3;

/// Fixed output encoding parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    /// Nominal frame rate
    pub frame_rate: u32,
    /// Keyframe interval in seconds
    pub keyframe_interval_secs: u32,
    /// Target bitrate in bits per second
    pub bit_rate: u64,
}

impl EncoderSettings {
    pub const MIME_TYPE: &'static str = "video/avc";

    /// GOP length in frames
    pub fn gop_size(&self) -> u32 {
        (self.frame_rate * self.keyframe_interval_secs).max(1)
    }

    /// Duration of one frame at the nominal rate, in microseconds
    pub fn frame_interval_us(&self) -> i64 {
        1_000_000 / self.frame_rate.max(1) as i64
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            keyframe_interval_secs: 1,
            bit_rate: 6_000_000,
        }
    }
}

/// Model settings for one segmentation strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the ONNX model file
    pub path: Option<PathBuf>,
    /// Model input width
    pub input_width: u32,
    /// Model input height
    pub input_height: u32,
    /// Tensor layout of both input and output
    pub layout: TensorLayout,
}

impl ModelConfig {
    fn with_size(width: u32, height: u32) -> Self {
        Self {
            path: None,
            input_width: width,
            input_height: height,
            layout: TensorLayout::Nhwc,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.input_width == 0 || self.input_height == 0 {
            return Err(ConfigError::ModelSize(self.input_width, self.input_height));
        }
        Ok(())
    }
}

/// Solid background color in linear [0, 1] RGB
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundColor(pub [f32; 3]);

impl BackgroundColor {
    pub const WHITE: Self = Self([1.0, 1.0, 1.0]);

    /// Parse `#RRGGBB` or `RRGGBB`
    pub fn from_hex(hex: &str) -> Result<Self, ConfigError> {
        let digits = hex.trim().trim_start_matches('#');
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::BackgroundColor(hex.to_string()));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map(|v| v as f32 / 255.0)
                .map_err(|_| ConfigError::BackgroundColor(hex.to_string()))
        };
        Ok(Self([channel(0)?, channel(2)?, channel(4)?]))
    }

    pub fn to_rgb8(self) -> [u8; 3] {
        self.0.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
    }
}

impl Default for BackgroundColor {
    fn default() -> Self {
        Self::WHITE
    }
}

/// Configuration for a [`crate::VideoProcessor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Mode used until `set_segmentation_mode` is called
    pub mode: SegmentationMode,
    /// Single-class person model (selfie segmentation)
    pub person_model: ModelConfig,
    /// Multi-class model (DeepLab style, class 0 = background)
    pub objects_model: ModelConfig,
    /// EMA coefficient for the person strategy, >= 0.99 disables the extra smoothing
    pub ema_alpha: f32,
    /// Color substituted for the background
    pub background: BackgroundColor,
    /// Optional morphological close applied to every mask
    pub hole_fill_kernel: Option<u32>,
    /// Timeout passed to every decoder/encoder poll
    pub poll_timeout_us: u64,
    /// Render the mask as grayscale instead of compositing
    pub show_matte: bool,
    /// Composite on the CPU instead of the GPU
    pub cpu_composite: bool,
    /// Output encoding parameters
    pub encoder: EncoderSettings,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            mode: SegmentationMode::PersonOnly,
            person_model: ModelConfig::with_size(256, 256),
            objects_model: ModelConfig::with_size(257, 257),
            ema_alpha: DEFAULT_EMA_ALPHA,
            background: BackgroundColor::WHITE,
            hole_fill_kernel: None,
            poll_timeout_us: 10_000,
            show_matte: false,
            cpu_composite: false,
            encoder: EncoderSettings::default(),
        }
    }
}

impl ProcessorConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.ema_alpha) || self.ema_alpha.is_nan() {
            return Err(ConfigError::EmaAlpha(self.ema_alpha));
        }
        if let Some(kernel) = self.hole_fill_kernel {
            if kernel == 0 || kernel % 2 == 0 {
                return Err(ConfigError::HoleFillKernel(kernel));
            }
        }
        self.person_model.validate()?;
        self.objects_model.validate()?;
        Ok(())
    }
}
