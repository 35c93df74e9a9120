//! Alert Routes

use alerting::AnomalyAlert;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;

/// Query parameters for alerts endpoint
#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    /// Maximum number of records
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Response for alerts endpoint
#[derive(Debug, Serialize)]
pub struct AlertResponse {
    pub data: Vec<AnomalyAlert>,
    pub count: usize,
    pub total_anomalies: u64,
    pub heartbeats: u64,
}

/// Recent anomaly alerts, newest first
pub async fn get_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertQuery>,
) -> Json<AlertResponse> {
    let data = state.alerts.recent(params.limit.min(1000));

    Json(AlertResponse {
        count: data.len(),
        total_anomalies: state.alerts.anomaly_count(),
        heartbeats: state.alerts.heartbeat_count(),
        data,
    })
}
