//! Reconstruction models

use crate::InferenceError;
use feature_engine::FEATURE_COUNT;
use std::path::Path;
use tracing::{debug, info};
use tract_onnx::prelude::*;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Maps a normalized feature vector to its reconstruction
pub trait Reconstructor: Send + Sync {
    fn reconstruct(&self, input: &[f32; FEATURE_COUNT]) -> Result<[f32; FEATURE_COUNT], InferenceError>;
}

/// Autoencoder exported to ONNX, taking a `1×1×5` f32 input
pub struct OnnxAutoencoder {
    plan: Plan,
}

impl OnnxAutoencoder {
    /// Load and optimize the model
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        info!("Loading autoencoder from {}", path.display());

        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| model.with_input_fact(0, f32::fact([1, 1, FEATURE_COUNT]).into()))
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| InferenceError::ModelLoadError(format!("{}: {}", path.display(), e)))?;

        info!("Model loaded successfully");
        Ok(Self { plan })
    }
}

impl Reconstructor for OnnxAutoencoder {
    fn reconstruct(&self, input: &[f32; FEATURE_COUNT]) -> Result<[f32; FEATURE_COUNT], InferenceError> {
        let tensor = Tensor::from_shape::<f32>(&[1, 1, FEATURE_COUNT], &input[..])
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;
        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let output = outputs
            .first()
            .ok_or_else(|| InferenceError::InferenceFailed("model produced no output".to_string()))?;
        let values = output
            .as_slice::<f32>()
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let reconstruction: [f32; FEATURE_COUNT] =
            values
                .try_into()
                .map_err(|_| InferenceError::InvalidOutputShape {
                    expected: format!("{} values", FEATURE_COUNT),
                    actual: format!("{:?}", output.shape()),
                })?;
        debug!("Reconstruction: {:?}", reconstruction);
        Ok(reconstruction)
    }
}
