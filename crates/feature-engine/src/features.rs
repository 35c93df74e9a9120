//! Feature Vector Assembly

use crate::FeatureError;
use chrono::{DateTime, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};

/// Number of features in the vector
pub const FEATURE_COUNT: usize = 5;

/// Feature names in model input order
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "device_temperature",
    "device_humidity",
    "climate_temperature",
    "climate_humidity",
    "hour_of_day",
];

/// Feature vector for anomaly scoring
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Device temperature (°C)
    pub device_temperature: f64,
    /// Device humidity as a 0-1 fraction
    pub device_humidity: f64,
    /// Outdoor temperature (°C)
    pub climate_temperature: f64,
    /// Outdoor humidity as a 0-1 fraction
    pub climate_humidity: f64,
    /// Local hour of the observation, 0-23
    pub hour_of_day: f64,
}

impl FeatureVector {
    /// Assemble a vector from one device observation and the climate at
    /// that time. Both device values must be present.
    pub fn assemble(
        device_temperature: Option<f64>,
        device_humidity: Option<f64>,
        climate_temperature: f64,
        climate_humidity: f64,
        observed_at: &DateTime<FixedOffset>,
    ) -> Result<Self, FeatureError> {
        Ok(Self {
            device_temperature: device_temperature
                .ok_or(FeatureError::MissingFeature("device_temperature"))?,
            device_humidity: device_humidity.ok_or(FeatureError::MissingFeature("device_humidity"))?,
            climate_temperature,
            climate_humidity,
            hour_of_day: f64::from(observed_at.hour()),
        })
    }

    /// Values in [`FEATURE_NAMES`] order
    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.device_temperature,
            self.device_humidity,
            self.climate_temperature,
            self.climate_humidity,
            self.hour_of_day,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, hour, 25, 0)
            .unwrap()
    }

    #[test]
    fn test_assemble_order() {
        let features = FeatureVector::assemble(Some(24.5), Some(0.55), 30.1, 0.7, &at(14)).unwrap();
        assert_eq!(features.to_array(), [24.5, 0.55, 30.1, 0.7, 14.0]);
    }

    #[test]
    fn test_hour_is_local() {
        let features = FeatureVector::assemble(Some(24.5), Some(0.55), 30.1, 0.7, &at(0)).unwrap();
        assert_eq!(features.hour_of_day, 0.0);
    }

    #[test]
    fn test_missing_device_value() {
        let result = FeatureVector::assemble(None, Some(0.55), 30.1, 0.7, &at(9));
        assert!(matches!(
            result,
            Err(FeatureError::MissingFeature("device_temperature"))
        ));
    }
}
