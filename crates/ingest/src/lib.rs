//! Telemetry Ingestion
//!
//! Subscribes to device telemetry on an MQTT broker and turns each publish
//! into a [`Reading`]. Provides:
//! - Connect and reconnect with an explicit backoff policy
//! - Topic-derived device identity with a reserved control segment
//! - JSON payload decoding with required-field checks
//! - A bounded hand-off queue that drops rather than buffers without limit

mod backoff;
mod manager;
mod message;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use manager::{ConnectionManager, ConnectionState, DispatchOutcome, MessageRouter};
pub use message::{decode_payload, device_from_topic, Reading};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ingestion error types
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Gave up reconnecting after {0} attempts")]
    RetriesExhausted(u32),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

/// Reasons a telemetry payload is rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} is not numeric")]
    InvalidField { field: &'static str },
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// MQTT broker host
    pub broker_host: String,
    /// MQTT port
    pub broker_port: u16,
    /// Client id (random when unset)
    pub client_id: Option<String>,
    /// Topic namespace; the subscription is `<namespace>/#`
    pub namespace: String,
    /// Second topic segment reserved for broker control messages
    pub reserved_segment: String,
    /// MQTT keep-alive (seconds)
    pub keep_alive_seconds: u64,
    /// Capacity of the hand-off queue between transport and workers
    pub queue_capacity: usize,
    /// Reconnect policy
    pub backoff: BackoffConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: None,
            namespace: "zigbee2mqtt".to_string(),
            reserved_segment: "bridge".to_string(),
            keep_alive_seconds: 60,
            queue_capacity: 1024,
            backoff: BackoffConfig::default(),
        }
    }
}
