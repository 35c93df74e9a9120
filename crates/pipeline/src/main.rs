//! Telemetry Pipeline - Main Entry Point

use anyhow::Context;
use pipeline::{init_logging, install_metrics, Pipeline, Settings};
use std::path::PathBuf;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref()).context("loading configuration")?;
    init_logging(&settings.logging)?;

    info!("=== Telemetry Pipeline v{} ===", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Configuration loaded from {}", path.display());
    }

    let metrics = match install_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics disabled: {}", e);
            None
        }
    };

    Pipeline::new(settings)
        .run(metrics)
        .await
        .context("pipeline failed")?;

    Ok(())
}
