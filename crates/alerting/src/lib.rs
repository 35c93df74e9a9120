//! Alerting System
//!
//! Receives the scorer's verdicts, logs them, keeps a bounded history of
//! recent anomalies and fans every event out to subscribers.

mod manager;

pub use manager::{AlertConfig, AlertManager};

use chrono::{DateTime, FixedOffset};
use serde::Serialize;

/// A reading whose reconstruction loss exceeded the threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyAlert {
    pub device: String,
    pub timestamp: DateTime<FixedOffset>,
    pub loss: f64,
    pub threshold: f64,
}

/// Outcome of scoring one reading
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    Anomaly(AnomalyAlert),
    /// Reading scored within the threshold
    Heartbeat {
        device: String,
        timestamp: DateTime<FixedOffset>,
        loss: f64,
    },
}

impl AlertEvent {
    pub fn device(&self) -> &str {
        match self {
            AlertEvent::Anomaly(alert) => &alert.device,
            AlertEvent::Heartbeat { device, .. } => device,
        }
    }

    pub fn is_anomaly(&self) -> bool {
        matches!(self, AlertEvent::Anomaly(_))
    }
}
