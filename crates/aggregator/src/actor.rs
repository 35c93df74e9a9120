//! Aggregator actor
//!
//! The aggregator runs as one task draining a bounded command channel, so
//! readings, climate samples and flushes are applied one at a time.

use crate::aggregator::{AggregatorSnapshot, FlushReport, FlushTrigger, HourlyAggregator};
use crate::AggregatorError;
use chrono::{DateTime, FixedOffset};
use climate::{ClimateObserver, ClimateReading};
use ingest::Reading;
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Messages accepted by the actor
#[derive(Debug)]
pub enum AggregatorCommand {
    Record(Reading),
    Climate(ClimateReading),
    Flush {
        trigger: FlushTrigger,
        at: DateTime<FixedOffset>,
        reply: oneshot::Sender<FlushReport>,
    },
    Snapshot {
        reply: oneshot::Sender<AggregatorSnapshot>,
    },
}

/// Cloneable sender side of the actor
#[derive(Debug, Clone)]
pub struct AggregatorHandle {
    sender: mpsc::Sender<AggregatorCommand>,
}

impl AggregatorHandle {
    /// Queue a reading, waiting for room in the channel
    pub async fn record(&self, reading: Reading) -> Result<(), AggregatorError> {
        self.sender
            .send(AggregatorCommand::Record(reading))
            .await
            .map_err(|_| AggregatorError::ChannelClosed)
    }

    /// Queue a climate sample without waiting
    pub fn push_climate(&self, reading: ClimateReading) -> Result<(), AggregatorError> {
        self.sender
            .try_send(AggregatorCommand::Climate(reading))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    counter!("telemetry_climate_samples_dropped_total").increment(1);
                    warn!("Aggregator busy, climate sample dropped");
                    AggregatorError::Busy
                }
                mpsc::error::TrySendError::Closed(_) => AggregatorError::ChannelClosed,
            })
    }

    /// Run a flush and wait for its report.
    ///
    /// `Timer` flushes go through [`HourlyAggregator::tick`] with `at` as
    /// the current time; other triggers flush the current hour in place.
    pub async fn flush(
        &self,
        trigger: FlushTrigger,
        at: DateTime<FixedOffset>,
    ) -> Result<FlushReport, AggregatorError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(AggregatorCommand::Flush { trigger, at, reply })
            .await
            .map_err(|_| AggregatorError::ChannelClosed)?;
        rx.await.map_err(|_| AggregatorError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<AggregatorSnapshot, AggregatorError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(AggregatorCommand::Snapshot { reply })
            .await
            .map_err(|_| AggregatorError::ChannelClosed)?;
        rx.await.map_err(|_| AggregatorError::ChannelClosed)
    }
}

impl ClimateObserver for AggregatorHandle {
    fn observe(&self, reading: ClimateReading) {
        if let Err(e) = self.push_climate(reading) {
            debug!("Climate sample not delivered: {}", e);
        }
    }
}

/// Single owner of the [`HourlyAggregator`]
pub struct AggregatorActor {
    aggregator: HourlyAggregator,
    receiver: mpsc::Receiver<AggregatorCommand>,
}

impl AggregatorActor {
    /// Create an actor and its handle
    pub fn new(aggregator: HourlyAggregator, capacity: usize) -> (AggregatorHandle, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            AggregatorHandle { sender },
            Self {
                aggregator,
                receiver,
            },
        )
    }

    /// Apply commands until every handle is dropped; returns the aggregator
    pub async fn run(mut self) -> HourlyAggregator {
        info!("Aggregator started at hour {}", self.aggregator.current_hour());

        while let Some(command) = self.receiver.recv().await {
            match command {
                AggregatorCommand::Record(reading) => {
                    self.aggregator.record(&reading);
                }
                AggregatorCommand::Climate(reading) => {
                    self.aggregator.push_climate(reading);
                }
                AggregatorCommand::Flush { trigger, at, reply } => {
                    let report = match trigger {
                        FlushTrigger::Timer => self.aggregator.tick(at),
                        other => self.aggregator.flush_all(other),
                    };
                    // caller may have given up waiting
                    let _ = reply.send(report);
                }
                AggregatorCommand::Snapshot { reply } => {
                    let _ = reply.send(self.aggregator.snapshot());
                }
            }
        }

        info!(
            "Aggregator stopped with {} rows pending",
            self.aggregator.pending_rows()
        );
        self.aggregator
    }
}

/// Spawn the actor on the runtime
pub fn spawn(
    aggregator: HourlyAggregator,
    capacity: usize,
) -> (AggregatorHandle, JoinHandle<HourlyAggregator>) {
    let (handle, actor) = AggregatorActor::new(aggregator, capacity);
    (handle, tokio::spawn(actor.run()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AggregatorConfig;
    use chrono::{TimeZone, Utc};
    use storage::{DeviceRegistry, TimeSeriesStore};

    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, hour, minute, 0)
            .unwrap()
    }

    fn start(dir: &std::path::Path) -> (AggregatorHandle, JoinHandle<HourlyAggregator>) {
        let registry = DeviceRegistry::load(dir.join("devices.json")).unwrap();
        let store = TimeSeriesStore::new(dir.join("data"));
        let aggregator = HourlyAggregator::new(registry, store, at(9, 0), &AggregatorConfig::default());
        spawn(aggregator, 16)
    }

    fn reading(device: &str, temperature: f64, observed_at: DateTime<FixedOffset>) -> Reading {
        Reading {
            device: device.to_string(),
            temperature: Some(temperature),
            humidity: Some(50.0),
            observed_at,
        }
    }

    #[tokio::test]
    async fn test_commands_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, task) = start(dir.path());

        handle.record(reading("sensor-A", 24.0, at(9, 1))).await.unwrap();
        handle.record(reading("sensor-B", 21.0, at(9, 2))).await.unwrap();
        handle
            .push_climate(ClimateReading {
                temperature: 30.0,
                humidity: 0.7,
                fetched_at: Utc::now(),
            })
            .unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.devices.len(), 2);
        assert_eq!(snapshot.climate_samples, 1);

        let report = handle.flush(FlushTrigger::Manual, at(9, 30)).await.unwrap();
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.hour, at(9, 0));

        drop(handle);
        let aggregator = task.await.unwrap();
        assert_eq!(aggregator.climate_samples(), 0);
    }

    #[tokio::test]
    async fn test_timer_flush_rolls_forward() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, task) = start(dir.path());

        handle.record(reading("sensor-A", 24.0, at(9, 1))).await.unwrap();
        let report = handle.flush(FlushTrigger::Timer, at(10, 0)).await.unwrap();
        assert_eq!(report.hour, at(9, 0));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current_hour, at(10, 0));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_fails_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, task) = start(dir.path());
        task.abort();
        let _ = task.await;

        assert!(matches!(
            handle.snapshot().await,
            Err(AggregatorError::ChannelClosed)
        ));
    }
}
