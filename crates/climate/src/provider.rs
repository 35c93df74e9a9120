//! Climate Providers

use crate::{ClimateConfig, ClimateError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Raw observation as reported by the provider (humidity in percent)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawObservation {
    pub temperature: f64,
    pub humidity_percent: f64,
}

/// Source of current ambient conditions
#[async_trait]
pub trait ClimateProvider: Send + Sync {
    /// Fetch the current observation
    async fn fetch(&self) -> Result<RawObservation, ClimateError>;

    /// Provider name for logging
    fn name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct WeatherBody {
    main: WeatherMain,
}

#[derive(Debug, Deserialize)]
struct WeatherMain {
    temp: f64,
    humidity: f64,
}

/// OpenWeatherMap current-weather client
pub struct OpenWeatherProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    latitude: f64,
    longitude: f64,
}

impl OpenWeatherProvider {
    /// Create a new provider from configuration
    pub fn new(config: &ClimateConfig) -> Result<Self, ClimateError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| ClimateError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            latitude: config.latitude,
            longitude: config.longitude,
        })
    }
}

#[async_trait]
impl ClimateProvider for OpenWeatherProvider {
    async fn fetch(&self) -> Result<RawObservation, ClimateError> {
        debug!(
            "Fetching climate data for ({}, {})",
            self.latitude, self.longitude
        );

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("lat", self.latitude.to_string()),
                ("lon", self.longitude.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
            ])
            .send()
            .await
            .map_err(|e| ClimateError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClimateError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(ClimateError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        parse_observation(&body)
    }

    fn name(&self) -> &str {
        "openweathermap"
    }
}

/// Parse a current-weather document into a raw observation
pub(crate) fn parse_observation(body: &str) -> Result<RawObservation, ClimateError> {
    let parsed: WeatherBody =
        serde_json::from_str(body).map_err(|e| ClimateError::Malformed(e.to_string()))?;

    if !parsed.main.temp.is_finite() || !parsed.main.humidity.is_finite() {
        return Err(ClimateError::Malformed("non-finite value".to_string()));
    }

    Ok(RawObservation {
        temperature: parsed.main.temp,
        humidity_percent: parsed.main.humidity,
    })
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| "Unknown error".to_string())
}
