//! Device Routes

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::{AppState, PipelineError};

/// Device record
#[derive(Debug, Serialize)]
pub struct DeviceRecord {
    pub device: String,
    pub device_number: u32,
    pub csv_file: String,
    /// Readings collected for the current hour
    pub bucket_size: usize,
}

/// Response for devices endpoint
#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub data: Vec<DeviceRecord>,
    pub count: usize,
    pub current_hour: String,
}

/// List registered devices
pub async fn get_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DeviceResponse>, PipelineError> {
    let snapshot = state.aggregator.snapshot().await?;

    let data: Vec<DeviceRecord> = snapshot
        .devices
        .into_iter()
        .map(|d| DeviceRecord {
            bucket_size: d.samples.len(),
            device: d.device,
            device_number: d.device_number,
            csv_file: d.csv_file,
        })
        .collect();

    Ok(Json(DeviceResponse {
        count: data.len(),
        current_hour: snapshot.current_hour.to_rfc3339(),
        data,
    }))
}

#[cfg(test)]
mod tests {
    use crate::create_router;
    use crate::test_support::*;
    use alerting::AlertManager;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use ingest::Reading;
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_lists_devices_with_bucket_size() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _task) = start_aggregator(dir.path());
        for temperature in [24.0, 25.0] {
            handle
                .record(Reading {
                    device: "sensor-A".to_string(),
                    temperature: Some(temperature),
                    humidity: Some(50.0),
                    observed_at: Utc::now().with_timezone(&tz()),
                })
                .await
                .unwrap();
        }
        let app = create_router(app_state(handle, Arc::new(AlertManager::default())));

        let response = app
            .oneshot(Request::get("/api/v1/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["count"], 1);
        assert_eq!(json["data"][0]["device"], "sensor-A");
        assert_eq!(json["data"][0]["device_number"], 1);
        assert_eq!(json["data"][0]["bucket_size"], 2);
    }
}
