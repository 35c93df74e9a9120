//! Logging and metrics setup

use crate::settings::LoggingConfig;
use crate::PipelineError;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize logging
pub fn init_logging(config: &LoggingConfig) -> Result<(), PipelineError> {
    let level = Level::from_str(&config.level)
        .map_err(|_| PipelineError::Logging(format!("unknown level {:?}", config.level)))?;

    let result = if config.json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };

    result.map_err(|e| PipelineError::Logging(e.to_string()))
}

/// Install the global Prometheus recorder
pub fn install_metrics() -> Result<PrometheusHandle, PipelineError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PipelineError::Metrics(e.to_string()))
}
