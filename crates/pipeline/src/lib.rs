//! Environmental Telemetry Pipeline
//!
//! Wires ingestion, hourly aggregation, climate enrichment and anomaly
//! scoring into one daemon, and serves a small status API.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::FixedOffset;
use ingest::ConnectionState;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

mod daemon;
mod routes;
mod settings;
mod telemetry;

pub use daemon::{run_dispatcher, run_manual_trigger, shutdown_signal, spawn_stdin_lines, Pipeline};
pub use settings::{ApiConfig, LoggingConfig, ManualTriggerConfig, Settings, StorageConfig};
pub use telemetry::{init_logging, install_metrics};

use aggregator::AggregatorHandle;
use alerting::AlertManager;
use climate::ClimateCache;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid UTC offset: {0} minutes")]
    InvalidOffset(i32),
    #[error("Logging setup failed: {0}")]
    Logging(String),
    #[error("Metrics setup failed: {0}")]
    Metrics(String),
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),
    #[error("Climate error: {0}")]
    Climate(#[from] climate::ClimateError),
    #[error("Feature error: {0}")]
    Feature(#[from] feature_engine::FeatureError),
    #[error("Inference error: {0}")]
    Inference(#[from] inference_engine::InferenceError),
    #[error("Aggregator error: {0}")]
    Aggregator(#[from] aggregator::AggregatorError),
    #[error("Ingest error: {0}")]
    Ingest(#[from] ingest::IngestError),
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match self {
            PipelineError::Aggregator(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub aggregator: AggregatorHandle,
    pub climate: Option<Arc<ClimateCache>>,
    pub alerts: Arc<AlertManager>,
    pub connection: watch::Receiver<ConnectionState>,
    pub metrics: Option<PrometheusHandle>,
    pub offset: FixedOffset,
    /// Version string
    pub version: String,
    /// Start time
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        aggregator: AggregatorHandle,
        climate: Option<Arc<ClimateCache>>,
        alerts: Arc<AlertManager>,
        connection: watch::Receiver<ConnectionState>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            aggregator,
            climate,
            alerts,
            connection,
            metrics: None,
            offset,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Instant::now(),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connection: String,
    pub current_hour: String,
    pub device_count: usize,
    pub climate_samples: usize,
    pub rows_pending: usize,
    pub anomalies: u64,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/devices", get(routes::devices::get_devices))
        .route("/api/v1/flush", post(routes::flush::post_flush))
        .route("/api/v1/alerts", get(routes::alerts::get_alerts))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, PipelineError> {
    let snapshot = state.aggregator.snapshot().await?;
    let connection = *state.connection.borrow();

    let healthy = connection == ConnectionState::Connected && snapshot.rows_pending == 0;
    Ok(Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        connection: connection.as_str().to_string(),
        current_hour: snapshot.current_hour.to_rfc3339(),
        device_count: snapshot.devices.len(),
        climate_samples: snapshot.climate_samples,
        rows_pending: snapshot.rows_pending,
        anomalies: state.alerts.anomaly_count(),
    }))
}

/// Prometheus exposition
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Serve the API until `shutdown` flips to `true`
pub async fn run_server(
    addr: &str,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), PipelineError> {
    let app = create_router(state);

    info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("API server stopped");
    Ok(())
}
