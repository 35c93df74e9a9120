//! Anomaly Scoring Engine
//!
//! Scores device readings with a reconstruction autoencoder: the normalized
//! feature vector goes through the model and the mean absolute
//! reconstruction error is compared against a threshold.

mod model;
mod scorer;
mod worker;

pub use model::{OnnxAutoencoder, Reconstructor};
pub use scorer::{AnomalyScorer, Assessment, DropReason, Score, Verdict};
pub use worker::ScoringWorker;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors during scoring
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Model load failed: {0}")]
    ModelLoadError(String),
    #[error("Inference failed: {0}")]
    InferenceFailed(String),
    #[error("Invalid output shape: expected {expected}, got {actual}")]
    InvalidOutputShape { expected: String, actual: String },
    #[error("Feature error: {0}")]
    Feature(#[from] feature_engine::FeatureError),
}

/// Scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Score readings at all
    pub enabled: bool,
    /// ONNX autoencoder
    pub model_path: String,
    /// Fitted min-max parameters (JSON)
    pub normalizer_path: String,
    /// Loss above which a reading is anomalous
    pub threshold: f64,
    /// Readings waiting to be scored
    pub queue_capacity: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model_path: "models/autoencoder.onnx".to_string(),
            normalizer_path: "models/normalizer.json".to_string(),
            threshold: 0.35,
            queue_capacity: 256,
        }
    }
}
