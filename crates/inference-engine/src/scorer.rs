//! Reconstruction-error scoring

use crate::model::Reconstructor;
use crate::InferenceError;
use chrono::{DateTime, FixedOffset};
use climate::ClimateReading;
use feature_engine::{FeatureError, FeatureVector, MinMaxNormalizer, FEATURE_COUNT};
use ingest::Reading;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Reconstruction loss of one feature vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    pub loss: f64,
    pub threshold: f64,
    pub is_anomaly: bool,
}

/// Score of one device reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub device: String,
    pub timestamp: DateTime<FixedOffset>,
    pub features: FeatureVector,
    pub score: Score,
}

/// Why a reading was not scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("no climate data available yet")]
    NoClimate,
    #[error("missing {0}")]
    MissingValue(&'static str),
}

/// Outcome of assessing one reading
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Scored(Assessment),
    Dropped(DropReason),
}

/// Scores readings against a reconstruction model
pub struct AnomalyScorer {
    normalizer: MinMaxNormalizer,
    model: Box<dyn Reconstructor>,
    threshold: f64,
    /// Most recent climate reading seen, used when none is supplied
    last_climate: Option<ClimateReading>,
}

impl AnomalyScorer {
    pub fn new(normalizer: MinMaxNormalizer, model: Box<dyn Reconstructor>, threshold: f64) -> Self {
        info!("Creating anomaly scorer: threshold={}", threshold);
        Self {
            normalizer,
            model,
            threshold,
            last_climate: None,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Mean absolute difference between the normalized input and its
    /// reconstruction
    pub fn score(&self, features: &FeatureVector) -> Result<Score, InferenceError> {
        let normalized = self.normalizer.transform(features);
        let mut input = [0.0f32; FEATURE_COUNT];
        for (slot, value) in input.iter_mut().zip(normalized) {
            *slot = value as f32;
        }

        let reconstruction = self.model.reconstruct(&input)?;
        let loss = input
            .iter()
            .zip(reconstruction.iter())
            .map(|(x, y)| f64::from((x - y).abs()))
            .sum::<f64>()
            / FEATURE_COUNT as f64;

        Ok(Score {
            loss,
            threshold: self.threshold,
            is_anomaly: loss > self.threshold,
        })
    }

    /// Score a device reading with the climate at that time.
    ///
    /// Without `climate` the last reading this scorer saw is used. Readings
    /// that cannot be scored (no climate was ever available, or a device
    /// value is missing) are dropped with the reason logged.
    pub fn assess(
        &mut self,
        reading: &Reading,
        climate: Option<ClimateReading>,
    ) -> Result<Verdict, InferenceError> {
        if let Some(climate) = climate {
            self.last_climate = Some(climate);
        }
        let Some(climate) = self.last_climate else {
            return Ok(self.drop_reading(reading, DropReason::NoClimate));
        };

        let features = match FeatureVector::assemble(
            reading.temperature,
            reading.humidity_fraction(),
            climate.temperature,
            climate.humidity,
            &reading.observed_at,
        ) {
            Ok(features) => features,
            Err(FeatureError::MissingFeature(name)) => {
                return Ok(self.drop_reading(reading, DropReason::MissingValue(name)));
            }
            Err(e) => return Err(e.into()),
        };

        let score = self.score(&features)?;
        debug!(
            "Scored {} at {}: loss={:.4}",
            reading.device, reading.observed_at, score.loss
        );

        Ok(Verdict::Scored(Assessment {
            device: reading.device.clone(),
            timestamp: reading.observed_at,
            features,
            score,
        }))
    }

    fn drop_reading(&self, reading: &Reading, reason: DropReason) -> Verdict {
        warn!(
            "Dropping reading from {} at {}: {}",
            reading.device, reading.observed_at, reason
        );
        Verdict::Dropped(reason)
    }
}
