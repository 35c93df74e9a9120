//! Feature Engineering Engine
//!
//! Builds the fixed five-feature vector scored by the anomaly model and
//! applies the offline-fitted min-max scaling to it.

mod features;
mod normalizer;

pub use features::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use normalizer::MinMaxNormalizer;

use thiserror::Error;

/// Feature errors
#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("Failed to read normalizer {path}: {message}")]
    Io { path: String, message: String },
    #[error("Invalid normalizer: {0}")]
    InvalidNormalizer(String),
    #[error("Missing feature: {0}")]
    MissingFeature(&'static str),
}
