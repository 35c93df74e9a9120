//! Min-max scaling with offline-fitted parameters

use crate::features::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
use crate::FeatureError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Serialized form of the fitted scaler
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NormalizerFile {
    feature_names: Vec<String>,
    data_min: Vec<f64>,
    data_max: Vec<f64>,
    #[serde(default = "default_feature_range")]
    feature_range: (f64, f64),
}

fn default_feature_range() -> (f64, f64) {
    (0.0, 1.0)
}

/// Scales each feature from its training range into the target range
#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxNormalizer {
    scale: [f64; FEATURE_COUNT],
    offset: [f64; FEATURE_COUNT],
}

impl MinMaxNormalizer {
    /// Build from per-feature training minima and maxima.
    ///
    /// A feature whose range is zero is scaled by 1.
    pub fn new(
        data_min: [f64; FEATURE_COUNT],
        data_max: [f64; FEATURE_COUNT],
        feature_range: (f64, f64),
    ) -> Result<Self, FeatureError> {
        let (low, high) = feature_range;
        if low >= high {
            return Err(FeatureError::InvalidNormalizer(format!(
                "feature range ({}, {}) is empty",
                low, high
            )));
        }

        let mut scale = [0.0; FEATURE_COUNT];
        let mut offset = [0.0; FEATURE_COUNT];
        for i in 0..FEATURE_COUNT {
            let range = data_max[i] - data_min[i];
            if !range.is_finite() || range < 0.0 {
                return Err(FeatureError::InvalidNormalizer(format!(
                    "{} has min {} above max {}",
                    FEATURE_NAMES[i], data_min[i], data_max[i]
                )));
            }
            let range = if range == 0.0 { 1.0 } else { range };
            scale[i] = (high - low) / range;
            offset[i] = low - data_min[i] * scale[i];
        }

        Ok(Self { scale, offset })
    }

    /// Load the fitted parameters from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FeatureError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| FeatureError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let normalizer = Self::from_json(&text)?;
        info!("Loaded normalizer from {}", path.display());
        Ok(normalizer)
    }

    /// Parse the fitted parameters from JSON text
    pub fn from_json(text: &str) -> Result<Self, FeatureError> {
        let file: NormalizerFile = serde_json::from_str(text)
            .map_err(|e| FeatureError::InvalidNormalizer(e.to_string()))?;

        if file.feature_names.iter().map(String::as_str).ne(FEATURE_NAMES) {
            return Err(FeatureError::InvalidNormalizer(format!(
                "feature names {:?} do not match {:?}",
                file.feature_names, FEATURE_NAMES
            )));
        }

        let data_min = to_fixed(&file.data_min, "data_min")?;
        let data_max = to_fixed(&file.data_max, "data_max")?;
        Self::new(data_min, data_max, file.feature_range)
    }

    /// Scale a feature vector
    pub fn transform(&self, features: &FeatureVector) -> [f64; FEATURE_COUNT] {
        let mut values = features.to_array();
        for (i, value) in values.iter_mut().enumerate() {
            *value = *value * self.scale[i] + self.offset[i];
        }
        values
    }
}

fn to_fixed(values: &[f64], field: &str) -> Result<[f64; FEATURE_COUNT], FeatureError> {
    values.try_into().map_err(|_| {
        FeatureError::InvalidNormalizer(format!(
            "{} has {} values, expected {}",
            field,
            values.len(),
            FEATURE_COUNT
        ))
    })
}
