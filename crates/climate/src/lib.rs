//! Ambient Climate Data
//!
//! Fetches outdoor temperature and humidity from an external weather
//! endpoint and serves them through a time-to-live cache that falls back to
//! the last known good reading when the endpoint is unavailable.

mod cache;
mod provider;

pub use cache::{ClimateCache, ClimateObserver};
pub use provider::{ClimateProvider, OpenWeatherProvider, RawObservation};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors while fetching climate data
#[derive(Debug, Error)]
pub enum ClimateError {
    #[error("Climate request failed: {0}")]
    Request(String),
    #[error("Climate endpoint returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Malformed climate response: {0}")]
    Malformed(String),
}

/// A normalized ambient climate reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClimateReading {
    /// Outdoor temperature (°C)
    pub temperature: f64,
    /// Outdoor relative humidity as a 0-1 fraction
    pub humidity: f64,
    /// Wall-clock time of the fetch
    pub fetched_at: DateTime<Utc>,
}

impl ClimateReading {
    /// Build a reading from a raw observation, converting percent humidity
    /// to a fraction.
    pub fn from_observation(raw: RawObservation, fetched_at: DateTime<Utc>) -> Self {
        Self {
            temperature: round2(raw.temperature),
            humidity: round2(raw.humidity_percent / 100.0),
            fetched_at,
        }
    }
}

/// Climate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClimateConfig {
    /// Weather endpoint URL
    pub endpoint: String,
    /// API key sent as `appid`
    pub api_key: String,
    /// Station latitude
    pub latitude: f64,
    /// Station longitude
    pub longitude: f64,
    /// Cache time-to-live (seconds, default: 600)
    pub ttl_seconds: u64,
    /// Period of the background refresh task (seconds, default: 180)
    pub refresh_interval_seconds: u64,
    /// HTTP request timeout (seconds)
    pub request_timeout_seconds: u64,
    /// Minimum wait after a failed fetch before the next attempt (seconds)
    pub failure_backoff_seconds: u64,
}

impl Default for ClimateConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://api.openweathermap.org/data/2.5/weather".to_string(),
            api_key: String::new(),
            latitude: 1.38,
            longitude: 103.85,
            ttl_seconds: 600,
            refresh_interval_seconds: 180,
            request_timeout_seconds: 10,
            failure_backoff_seconds: 60,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
