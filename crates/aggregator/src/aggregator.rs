//! Hourly aggregation state machine

use crate::bucket::{hour_floor, mean, round2, HourBucket, Sample};
use crate::AggregatorConfig;
use chrono::{DateTime, Duration, FixedOffset};
use climate::ClimateReading;
use ingest::Reading;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use storage::{DeviceRegistry, FileKey, PersistedRow, SampleCounts, TimeSeriesStore};
use tracing::{debug, error, info, warn};

/// Why a flush ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// A reading arrived for a later hour
    Rollover,
    /// The top-of-hour timer fired
    Timer,
    /// An operator asked for it
    Manual,
    /// Shutdown
    Final,
}

/// Result of one flush of every registered device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    /// Hour the rows were written for
    pub hour: DateTime<FixedOffset>,
    /// Rows staged by this flush
    pub devices: usize,
    /// Rows written to disk, including retried ones
    pub rows_written: usize,
    /// Rows still waiting for a successful write
    pub rows_pending: usize,
}

/// Point-in-time view of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub device: String,
    pub device_number: u32,
    pub csv_file: String,
    pub samples: Vec<Sample>,
}

/// Point-in-time view of the aggregator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatorSnapshot {
    pub current_hour: DateTime<FixedOffset>,
    pub devices: Vec<DeviceStatus>,
    pub climate_samples: usize,
    pub rows_pending: usize,
}

/// A summarized row that has not been written yet
#[derive(Debug, Clone)]
struct PendingRow {
    device: String,
    key: FileKey,
    row: PersistedRow,
    counts: SampleCounts,
    attempts: u32,
}

/// Owns the hour pointer, the per-device buckets, the climate log of the
/// current hour, and the rows waiting to be persisted.
pub struct HourlyAggregator {
    current_hour: DateTime<FixedOffset>,
    buckets: HashMap<String, HourBucket>,
    climate_log: Vec<ClimateReading>,
    registry: DeviceRegistry,
    store: TimeSeriesStore,
    outbox: VecDeque<PendingRow>,
    outbox_capacity: usize,
}

impl HourlyAggregator {
    /// Start aggregating the hour containing `now`
    pub fn new(
        registry: DeviceRegistry,
        store: TimeSeriesStore,
        now: DateTime<FixedOffset>,
        config: &AggregatorConfig,
    ) -> Self {
        let current_hour = hour_floor(now);
        info!(
            "Aggregating from {} for {} known devices",
            current_hour,
            registry.len()
        );
        Self {
            current_hour,
            buckets: HashMap::new(),
            climate_log: Vec::new(),
            registry,
            store,
            outbox: VecDeque::new(),
            outbox_capacity: config.outbox_capacity.max(1),
        }
    }

    pub fn current_hour(&self) -> DateTime<FixedOffset> {
        self.current_hour
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn bucket(&self, device: &str) -> Option<&HourBucket> {
        self.buckets.get(device)
    }

    pub fn climate_samples(&self) -> usize {
        self.climate_log.len()
    }

    /// Rows waiting for a successful write
    pub fn pending_rows(&self) -> usize {
        self.outbox.len()
    }

    /// Record a decoded reading; humidity arrives in percent
    pub fn record(&mut self, reading: &Reading) -> usize {
        self.add_reading(
            &reading.device,
            reading.temperature,
            reading.humidity_fraction(),
            reading.observed_at,
        )
    }

    /// Add one sample (humidity as a 0-1 fraction) observed at `observed_at`.
    ///
    /// Readings for a later hour first flush every hour in between. Returns
    /// the number of flushes that ran.
    pub fn add_reading(
        &mut self,
        device: &str,
        temperature: Option<f64>,
        humidity: Option<f64>,
        observed_at: DateTime<FixedOffset>,
    ) -> usize {
        let flushes = self.roll_forward(observed_at);

        if observed_at < self.current_hour {
            debug!(
                "Reading from {} at {} predates hour {}, counted in current hour",
                device, observed_at, self.current_hour
            );
        }

        let registration = self.registry.register(device, &self.current_hour);
        if registration.is_new() {
            if let Err(e) = self.registry.save() {
                error!("Failed to save device registry: {}", e);
                counter!("telemetry_registry_save_failures_total").increment(1);
            }
            gauge!("telemetry_devices_registered").set(self.registry.len() as f64);
        }

        self.buckets.entry(device.to_string()).or_default().push(Sample {
            temperature,
            humidity: humidity.map(round2),
        });
        counter!("telemetry_readings_aggregated_total").increment(1);
        flushes
    }

    /// Append a climate reading to the current hour's log
    pub fn push_climate(&mut self, reading: ClimateReading) {
        debug!(
            "Climate sample {:.2} C / {:.2} for hour {}",
            reading.temperature, reading.humidity, self.current_hour
        );
        self.climate_log.push(reading);
    }

    /// Summarize one device's bucket for the current hour and persist it.
    ///
    /// The bucket is cleared once the row is handed to the outbox. Returns
    /// the staged row, or `None` for an unregistered device.
    pub fn flush(&mut self, device: &str) -> Option<PersistedRow> {
        let (climate_temperature, climate_humidity) = self.climate_means();
        let row = self.stage(device, climate_temperature, climate_humidity)?;
        self.drain_outbox();
        Some(row)
    }

    /// Flush every registered device for the current hour, then clear the
    /// climate log. The hour pointer is not moved.
    pub fn flush_all(&mut self, trigger: FlushTrigger) -> FlushReport {
        let (climate_temperature, climate_humidity) = self.climate_means();

        let mut devices = 0;
        for device in self.registry.devices() {
            if self.stage(&device, climate_temperature, climate_humidity).is_some() {
                devices += 1;
            }
        }

        let rows_written = self.drain_outbox();
        if let Err(e) = self.registry.save() {
            error!("Failed to save device registry: {}", e);
            counter!("telemetry_registry_save_failures_total").increment(1);
        }
        self.climate_log.clear();

        counter!("telemetry_flushes_total", "trigger" => trigger_label(trigger)).increment(1);
        info!(
            "{:?} flush of hour {}: {} devices, {} rows written, {} pending",
            trigger,
            self.current_hour,
            devices,
            rows_written,
            self.outbox.len()
        );

        FlushReport {
            trigger,
            hour: self.current_hour,
            devices,
            rows_written,
            rows_pending: self.outbox.len(),
        }
    }

    /// Timer entry point: roll forward when `now` is past the current hour,
    /// otherwise flush the current hour in place.
    pub fn tick(&mut self, now: DateTime<FixedOffset>) -> FlushReport {
        if now < self.current_hour + Duration::hours(1) {
            return self.flush_all(FlushTrigger::Timer);
        }

        let mut report: Option<FlushReport> = None;
        while now >= self.current_hour + Duration::hours(1) {
            let flushed = self.flush_all(FlushTrigger::Timer);
            self.current_hour = self.current_hour + Duration::hours(1);
            report = Some(match report {
                None => flushed,
                Some(previous) => FlushReport {
                    devices: previous.devices + flushed.devices,
                    rows_written: previous.rows_written + flushed.rows_written,
                    ..flushed
                },
            });
        }
        debug!("Hour pointer advanced to {}", self.current_hour);
        // Loop body runs at least once
        report.unwrap_or_else(|| self.flush_all(FlushTrigger::Timer))
    }

    /// Current state for inspection
    pub fn snapshot(&self) -> AggregatorSnapshot {
        let devices = self
            .registry
            .iter()
            .map(|(device, entry)| DeviceStatus {
                device: device.to_string(),
                device_number: entry.device_number,
                csv_file: entry.csv_file.clone(),
                samples: self
                    .buckets
                    .get(device)
                    .map(|b| b.samples().to_vec())
                    .unwrap_or_default(),
            })
            .collect();

        AggregatorSnapshot {
            current_hour: self.current_hour,
            devices,
            climate_samples: self.climate_log.len(),
            rows_pending: self.outbox.len(),
        }
    }

    fn roll_forward(&mut self, observed_at: DateTime<FixedOffset>) -> usize {
        let mut flushes = 0;
        while observed_at >= self.current_hour + Duration::hours(1) {
            self.flush_all(FlushTrigger::Rollover);
            self.current_hour = self.current_hour + Duration::hours(1);
            flushes += 1;
        }
        if flushes > 1 {
            warn!(
                "Skipped {} hours without readings, now at {}",
                flushes - 1,
                self.current_hour
            );
        }
        flushes
    }

    fn climate_means(&self) -> (Option<f64>, Option<f64>) {
        let (temperature, _) = mean(self.climate_log.iter().map(|c| c.temperature));
        let (humidity, _) = mean(self.climate_log.iter().map(|c| c.humidity));
        (temperature, humidity)
    }

    /// Build the device's row, move it into the outbox and clear the bucket
    fn stage(
        &mut self,
        device: &str,
        climate_temperature: Option<f64>,
        climate_humidity: Option<f64>,
    ) -> Option<PersistedRow> {
        let sequence = self.registry.get(device)?.device_number;
        let key = FileKey::for_hour(sequence, &self.current_hour);
        self.registry.set_file(device, &key);

        let bucket = self.buckets.remove(device).unwrap_or_default();
        let (device_temperature, device_humidity, counts) = bucket.averages();
        let row = PersistedRow {
            timestamp: self.current_hour,
            device_temperature,
            device_humidity,
            climate_temperature,
            climate_humidity,
        };

        if self.outbox.len() >= self.outbox_capacity {
            if let Some(dropped) = self.outbox.pop_front() {
                error!(
                    "Outbox full, discarding row {} for device {} after {} attempts",
                    dropped.row.time_label(),
                    dropped.device,
                    dropped.attempts
                );
                counter!("telemetry_rows_discarded_total").increment(1);
            }
        }
        self.outbox.push_back(PendingRow {
            device: device.to_string(),
            key,
            row,
            counts,
            attempts: 0,
        });
        Some(row)
    }

    /// Try to write every pending row, oldest first. A device whose row
    /// fails keeps its later rows queued so its file stays in hour order.
    fn drain_outbox(&mut self) -> usize {
        let mut written = 0;
        let mut blocked: HashSet<String> = HashSet::new();
        let mut remaining = VecDeque::with_capacity(self.outbox.len());

        while let Some(mut pending) = self.outbox.pop_front() {
            if blocked.contains(&pending.device) {
                remaining.push_back(pending);
                continue;
            }

            match self
                .store
                .write_or_merge(&pending.key, &pending.row, pending.counts)
            {
                Ok(outcome) => {
                    written += 1;
                    counter!("telemetry_rows_written_total").increment(1);
                    debug!(
                        "{:?} row {} for device {} in {}",
                        outcome,
                        pending.row.time_label(),
                        pending.device,
                        pending.key.file_name()
                    );
                }
                Err(e) => {
                    pending.attempts += 1;
                    error!(
                        "Failed to persist row {} for device {} (attempt {}): {}",
                        pending.row.time_label(),
                        pending.device,
                        pending.attempts,
                        e
                    );
                    counter!("telemetry_persist_failures_total").increment(1);
                    blocked.insert(pending.device.clone());
                    remaining.push_back(pending);
                }
            }
        }

        self.outbox = remaining;
        gauge!("telemetry_rows_pending").set(self.outbox.len() as f64);
        written
    }
}

fn trigger_label(trigger: FlushTrigger) -> &'static str {
    match trigger {
        FlushTrigger::Rollover => "rollover",
        FlushTrigger::Timer => "timer",
        FlushTrigger::Manual => "manual",
        FlushTrigger::Final => "final",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::fs;
    use std::path::Path;

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        tz().with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    fn aggregator(dir: &Path, now: DateTime<FixedOffset>) -> HourlyAggregator {
        let registry = DeviceRegistry::load(dir.join("devices.json")).unwrap();
        let store = TimeSeriesStore::new(dir.join("data"));
        HourlyAggregator::new(registry, store, now, &AggregatorConfig::default())
    }

    fn climate(temperature: f64, humidity: f64) -> ClimateReading {
        ClimateReading {
            temperature,
            humidity,
            fetched_at: Utc::now(),
        }
    }

    fn key_for(agg: &HourlyAggregator, device: &str, hour: DateTime<FixedOffset>) -> FileKey {
        FileKey::for_hour(agg.registry().get(device).unwrap().device_number, &hour)
    }

    #[test]
    fn test_single_hour_with_climate() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path(), at(9, 0));

        agg.add_reading("sensor-A", Some(24.0), Some(0.50), at(9, 10));
        agg.add_reading("sensor-A", Some(26.0), Some(0.60), at(9, 40));
        agg.push_climate(climate(25.0, 0.55));

        let flushes = agg.add_reading("sensor-A", Some(27.0), Some(0.62), at(10, 5));
        assert_eq!(flushes, 1);
        assert_eq!(agg.current_hour(), at(10, 0));

        let rows = agg.store.rows(&key_for(&agg, "sensor-A", at(9, 0))).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, at(9, 0));
        assert_eq!(rows[0].device_temperature, Some(25.0));
        assert_eq!(rows[0].device_humidity, Some(0.55));
        assert_eq!(rows[0].climate_temperature, Some(25.0));
        assert_eq!(rows[0].climate_humidity, Some(0.55));

        // the 10:05 reading is the only sample of the new hour
        assert_eq!(agg.bucket("sensor-A").unwrap().len(), 1);
        assert_eq!(agg.climate_samples(), 0);
    }

    #[test]
    fn test_record_converts_percent_humidity() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path(), at(9, 0));
        let reading = Reading {
            device: "0xa4c1383628a7fd0c".to_string(),
            temperature: Some(23.5),
            humidity: Some(55.0),
            observed_at: at(9, 3),
        };

        agg.record(&reading);

        let sample = agg.bucket("0xa4c1383628a7fd0c").unwrap().samples()[0];
        assert_eq!(sample.temperature, Some(23.5));
        assert_eq!(sample.humidity, Some(0.55));
    }

    #[test]
    fn test_new_device_saves_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path(), at(9, 0));
        agg.add_reading("sensor-A", Some(24.0), None, at(9, 1));

        let reloaded = DeviceRegistry::load(dir.path().join("devices.json")).unwrap();
        assert_eq!(reloaded.get("sensor-A").unwrap().device_number, 1);
    }

    #[test]
    fn test_empty_hour_writes_null_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path(), at(9, 0));
        agg.add_reading("sensor-A", Some(24.0), Some(0.5), at(9, 1));
        agg.add_reading("sensor-B", Some(21.0), Some(0.4), at(9, 2));

        // sensor-B goes quiet during 10:00
        agg.add_reading("sensor-A", Some(24.0), Some(0.5), at(10, 1));
        agg.add_reading("sensor-A", Some(24.0), Some(0.5), at(11, 1));

        let rows = agg.store.rows(&key_for(&agg, "sensor-B", at(10, 0))).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].timestamp, at(10, 0));
        assert_eq!(rows[1].device_temperature, None);
        assert_eq!(rows[1].device_humidity, None);
    }

    #[test]
    fn test_gap_flushes_each_hour() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path(), at(9, 0));
        agg.add_reading("sensor-A", Some(24.0), None, at(9, 1));

        let flushes = agg.add_reading("sensor-A", Some(24.0), None, at(13, 30));
        assert_eq!(flushes, 4);
        assert_eq!(agg.current_hour(), at(13, 0));

        let rows = agg.store.rows(&key_for(&agg, "sensor-A", at(9, 0))).unwrap();
        let hours: Vec<_> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(hours, vec![at(9, 0), at(10, 0), at(11, 0), at(12, 0)]);
    }

    #[test]
    fn test_manual_flush_then_more_readings_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path(), at(9, 0));

        agg.add_reading("sensor-A", Some(20.0), None, at(9, 5));
        agg.add_reading("sensor-A", Some(22.0), None, at(9, 10));
        let report = agg.flush_all(FlushTrigger::Manual);
        assert_eq!(report.rows_written, 1);
        assert_eq!(report.hour, at(9, 0));
        assert!(agg.bucket("sensor-A").is_none());

        agg.add_reading("sensor-A", Some(26.0), None, at(9, 20));
        agg.flush_all(FlushTrigger::Final);

        let rows = agg.store.rows(&key_for(&agg, "sensor-A", at(9, 0))).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_temperature, Some(22.67));
    }

    #[test]
    fn test_tick_in_hour_flushes_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path(), at(9, 0));
        agg.add_reading("sensor-A", Some(24.0), None, at(9, 1));

        let report = agg.tick(at(9, 59));
        assert_eq!(report.trigger, FlushTrigger::Timer);
        assert_eq!(report.hour, at(9, 0));
        assert_eq!(agg.current_hour(), at(9, 0));
    }

    #[test]
    fn test_tick_after_hour_rolls_forward() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path(), at(9, 0));
        agg.add_reading("sensor-A", Some(24.0), None, at(9, 1));

        let report = agg.tick(at(10, 0));
        assert_eq!(report.hour, at(9, 0));
        assert_eq!(report.rows_written, 1);
        assert_eq!(agg.current_hour(), at(10, 0));
    }

    #[test]
    fn test_persist_failure_keeps_row_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where the data directory should be
        let blocker = dir.path().join("data");
        fs::write(&blocker, "not a directory").unwrap();

        let mut agg = aggregator(dir.path(), at(9, 0));
        agg.add_reading("sensor-A", Some(24.0), Some(0.5), at(9, 1));
        agg.add_reading("sensor-A", Some(26.0), Some(0.5), at(9, 2));

        let report = agg.flush_all(FlushTrigger::Manual);
        assert_eq!(report.rows_written, 0);
        assert_eq!(report.rows_pending, 1);
        // bucket was cleared; the summary lives in the outbox
        assert!(agg.bucket("sensor-A").is_none());

        fs::remove_file(&blocker).unwrap();
        let report = agg.flush_all(FlushTrigger::Manual);
        assert_eq!(report.rows_pending, 0);
        assert_eq!(report.rows_written, 2);

        let rows = agg.store.rows(&key_for(&agg, "sensor-A", at(9, 0))).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_temperature, Some(25.0));
    }

    #[test]
    fn test_outbox_discards_oldest_when_full() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("data"), "not a directory").unwrap();

        let registry = DeviceRegistry::load(dir.path().join("devices.json")).unwrap();
        let store = TimeSeriesStore::new(dir.path().join("data"));
        let config = AggregatorConfig {
            outbox_capacity: 2,
            ..AggregatorConfig::default()
        };
        let mut agg = HourlyAggregator::new(registry, store, at(9, 0), &config);

        agg.add_reading("sensor-A", Some(24.0), None, at(9, 1));
        agg.add_reading("sensor-A", Some(24.0), None, at(12, 1));
        assert_eq!(agg.pending_rows(), 2);
    }

    #[test]
    fn test_month_rotation_uses_row_hour() {
        let dir = tempfile::tempdir().unwrap();
        let end_of_june = tz().with_ymd_and_hms(2024, 6, 30, 23, 10, 0).unwrap();
        let start_of_july = tz().with_ymd_and_hms(2024, 7, 1, 0, 5, 0).unwrap();
        let mut agg = aggregator(dir.path(), end_of_june);

        agg.add_reading("sensor-A", Some(24.0), None, end_of_june);
        agg.add_reading("sensor-A", Some(25.0), None, start_of_july);
        agg.flush_all(FlushTrigger::Final);

        let june = FileKey::for_hour(1, &end_of_june);
        let july = FileKey::for_hour(1, &start_of_july);
        assert_eq!(agg.store.rows(&june).unwrap().len(), 1);
        assert_eq!(agg.store.rows(&july).unwrap().len(), 1);
        assert_eq!(
            agg.registry().get("sensor-A").unwrap().csv_file,
            july.file_name()
        );
    }

    #[test]
    fn test_snapshot_lists_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path(), at(9, 0));
        agg.add_reading("sensor-A", Some(24.0), Some(0.5), at(9, 1));
        agg.push_climate(climate(30.0, 0.7));

        let snapshot = agg.snapshot();
        assert_eq!(snapshot.current_hour, at(9, 0));
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices[0].samples.len(), 1);
        assert_eq!(snapshot.climate_samples, 1);
        assert_eq!(snapshot.rows_pending, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_row_is_mean_of_non_null_values(
            temps in proptest::collection::vec(proptest::option::of(-40i32..60), 1..20)
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut agg = aggregator(dir.path(), at(9, 0));
            for (i, t) in temps.iter().enumerate() {
                agg.add_reading("sensor-A", t.map(f64::from), None, at(9, i as u32));
            }
            let row = agg.flush("sensor-A").unwrap();

            let present: Vec<f64> = temps.iter().filter_map(|t| t.map(f64::from)).collect();
            let expected = if present.is_empty() {
                None
            } else {
                Some(round2(present.iter().sum::<f64>() / present.len() as f64))
            };
            prop_assert_eq!(row.device_temperature, expected);
        }

        #[test]
        fn prop_hours_ahead_flush_once_each(hours in 1u32..10) {
            let dir = tempfile::tempdir().unwrap();
            let mut agg = aggregator(dir.path(), at(9, 0));
            agg.add_reading("sensor-A", Some(24.0), None, at(9, 0));

            let later = at(9, 0) + Duration::hours(i64::from(hours));
            let flushes = agg.add_reading("sensor-A", Some(24.0), None, later);

            prop_assert_eq!(flushes, hours as usize);
            prop_assert_eq!(agg.current_hour(), later);
        }
    }
}
