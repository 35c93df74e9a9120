//! Daemon configuration

use crate::PipelineError;
use aggregator::AggregatorConfig;
use alerting::AlertConfig;
use chrono::FixedOffset;
use climate::ClimateConfig;
use inference_engine::ScoringConfig;
use ingest::IngestConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level: trace, debug, info, warn or error
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Where aggregated data lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the monthly time-series files
    pub data_dir: PathBuf,
    /// Device registry document
    pub registry_path: PathBuf,
    /// UTC offset used for hour boundaries and timestamps (minutes)
    pub utc_offset_minutes: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            registry_path: PathBuf::from("devices.json"),
            utc_offset_minutes: 480,
        }
    }
}

/// Status API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Operator flush triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualTriggerConfig {
    /// Flush when an empty line is entered on standard input
    pub stdin: bool,
}

impl Default for ManualTriggerConfig {
    fn default() -> Self {
        Self { stdin: true }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub mqtt: IngestConfig,
    pub climate: ClimateConfig,
    pub storage: StorageConfig,
    pub aggregator: AggregatorConfig,
    pub scoring: ScoringConfig,
    pub alerting: AlertConfig,
    pub api: ApiConfig,
    pub manual_trigger: ManualTriggerConfig,
}

impl Settings {
    /// Layer an optional TOML file and `TELEMETRY__*` environment variables
    /// over the defaults. `TELEMETRY__MQTT__BROKER_HOST` sets
    /// `mqtt.broker_host`.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TELEMETRY")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Offset for hour boundaries and timestamps
    pub fn offset(&self) -> Result<FixedOffset, PipelineError> {
        let minutes = self.storage.utc_offset_minutes;
        FixedOffset::east_opt(minutes * 60).ok_or(PipelineError::InvalidOffset(minutes))
    }

    /// Whether a climate source is configured
    pub fn climate_enabled(&self) -> bool {
        !self.climate.api_key.is_empty()
    }
}
