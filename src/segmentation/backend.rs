use std::path::Path;

use ndarray::{Array4, ArrayD};
use ort::session::{builder::GraphOptimizationLevel, Session};

use crate::error::SegmentationError;

/// Runs one model on a preprocessed tensor
pub trait InferenceBackend: Send {
    /// Run inference and return the first output tensor, or `None` if the
    /// model produced no output for this input
    fn run(&mut self, input: Array4<f32>) -> Result<Option<ArrayD<f32>>, SegmentationError>;

    /// Short name for diagnostics
    fn name(&self) -> &str;
}

/// ONNX Runtime backend
pub struct OrtBackend {
    session: Session,
    name: String,
}

impl OrtBackend {
    /// Load an ONNX model
    ///
    /// # Default Configuration
    /// - Graph optimization level 3
    /// - 4 intra-op threads
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self, SegmentationError> {
        let path = model_path.as_ref();

        tracing::info!("Loading segmentation model from {}", path.display());

        let load_error = |e: ort::Error| SegmentationError::ModelLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        let session = Session::builder()
            .map_err(load_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_error)?
            .with_intra_threads(4)
            .map_err(load_error)?
            .commit_from_file(path)
            .map_err(load_error)?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        tracing::info!(
            "Model {} loaded: {} input(s), {} output(s)",
            name,
            session.inputs.len(),
            session.outputs.len()
        );

        Ok(Self { session, name })
    }
}

impl InferenceBackend for OrtBackend {
    fn run(&mut self, input: Array4<f32>) -> Result<Option<ArrayD<f32>>, SegmentationError> {
        let _span = tracing::debug_span!("inference", model = %self.name).entered();

        let tensor = ort::value::Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| SegmentationError::Inference(e.to_string()))?;

        let Some((_, first)) = outputs.iter().next() else {
            return Ok(None);
        };
        let array = first.try_extract_array::<f32>()?;
        if array.is_empty() {
            return Ok(None);
        }
        Ok(Some(array.to_owned().into_dyn()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
