//! Hourly Aggregation Engine
//!
//! Collects device readings into hour buckets, rolls the global hour pointer
//! forward as time passes, and persists one averaged row per device per hour
//! enriched with the climate readings seen during that hour.
//!
//! All state is owned by [`HourlyAggregator`]; concurrent producers reach it
//! only through the [`AggregatorHandle`] of a single [`AggregatorActor`].

mod actor;
mod aggregator;
mod bucket;
mod timer;

pub use actor::{spawn, AggregatorActor, AggregatorCommand, AggregatorHandle};
pub use aggregator::{AggregatorSnapshot, DeviceStatus, FlushReport, FlushTrigger, HourlyAggregator};
pub use bucket::{hour_floor, HourBucket, Sample};
pub use timer::{duration_until_next_hour, run_climate_refresh, run_hourly_flush, trigger_flush};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Aggregator errors
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("Aggregator has stopped")]
    ChannelClosed,
    #[error("Aggregator command queue is full")]
    Busy,
}

/// Aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Capacity of the actor's command channel
    pub command_capacity: usize,
    /// Maximum rows held for retry after persistence failures
    pub outbox_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            command_capacity: 1024,
            outbox_capacity: 10_000,
        }
    }
}
