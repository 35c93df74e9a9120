//! Hourly Time-Series Files

use crate::{write_atomic, StorageError};
use chrono::{DateTime, Datelike, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Header line of every time-series file
pub const CSV_HEADER: &str =
    "time,device_temperature,device_humidity,climate_temperature,climate_humidity";

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Identity of one output file: a device's rows for one calendar month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    pub sequence: u32,
    pub year: i32,
    pub month: u32,
}

impl FileKey {
    /// File holding the row for `hour`
    pub fn for_hour(sequence: u32, hour: &DateTime<FixedOffset>) -> Self {
        Self {
            sequence,
            year: hour.year(),
            month: hour.month(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "device_{}_temperature_data_{:04}-{:02}.csv",
            self.sequence, self.year, self.month
        )
    }
}

/// One persisted hourly summary
///
/// Serializes to one CSV record: the time column with millisecond precision
/// and values with two decimals, nulls as empty cells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistedRow {
    /// Hour-aligned timestamp
    #[serde(rename = "time", with = "time_column")]
    pub timestamp: DateTime<FixedOffset>,
    #[serde(with = "value_column")]
    pub device_temperature: Option<f64>,
    #[serde(with = "value_column")]
    pub device_humidity: Option<f64>,
    #[serde(with = "value_column")]
    pub climate_temperature: Option<f64>,
    #[serde(with = "value_column")]
    pub climate_humidity: Option<f64>,
}

impl PersistedRow {
    /// Time column value, e.g. `2024-06-01T09:00:00.000+08:00`
    pub fn time_label(&self) -> String {
        self.timestamp.format(TIME_FORMAT).to_string()
    }
}

mod time_column {
    use super::TIME_FORMAT;
    use chrono::{DateTime, FixedOffset};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &DateTime<FixedOffset>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(TIME_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<FixedOffset>, D::Error> {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_str(text.trim(), TIME_FORMAT)
            .map_err(|e| de::Error::custom(format!("bad time {}: {}", text, e)))
    }
}

mod value_column {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(&format!("{:.2}", v)),
            None => serializer.serialize_str(""),
        }
    }

    /// Empty cells and `nan` read back as null
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("nan") {
            return Ok(None);
        }
        text.parse::<f64>()
            .map(Some)
            .map_err(|e| de::Error::custom(format!("bad value {}: {}", text, e)))
    }
}

/// Number of readings behind each device average of a row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCounts {
    pub temperature: usize,
    pub humidity: usize,
}

impl SampleCounts {
    /// Counts assumed for a row read from disk with no recorded history
    fn assumed(row: &PersistedRow) -> Self {
        Self {
            temperature: row.device_temperature.is_some() as usize,
            humidity: row.device_humidity.is_some() as usize,
        }
    }
}

/// What a write did to the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Appended,
    Merged,
}

/// Merge a new summary into an existing row for the same hour.
///
/// Device values are averaged weighted by sample count; climate values are
/// replaced by the newer value when it is present.
pub fn merge_rows(
    existing: &PersistedRow,
    existing_counts: SampleCounts,
    new: &PersistedRow,
    new_counts: SampleCounts,
) -> (PersistedRow, SampleCounts) {
    let (temperature, temperature_count) = weighted(
        existing.device_temperature,
        existing_counts.temperature,
        new.device_temperature,
        new_counts.temperature,
    );
    let (humidity, humidity_count) = weighted(
        existing.device_humidity,
        existing_counts.humidity,
        new.device_humidity,
        new_counts.humidity,
    );

    let merged = PersistedRow {
        timestamp: existing.timestamp,
        device_temperature: temperature,
        device_humidity: humidity,
        climate_temperature: new.climate_temperature.or(existing.climate_temperature),
        climate_humidity: new.climate_humidity.or(existing.climate_humidity),
    };
    let counts = SampleCounts {
        temperature: temperature_count,
        humidity: humidity_count,
    };
    (merged, counts)
}

fn weighted(
    existing: Option<f64>,
    existing_count: usize,
    new: Option<f64>,
    new_count: usize,
) -> (Option<f64>, usize) {
    match (existing, new) {
        (Some(e), Some(n)) if existing_count + new_count > 0 => {
            let total = existing_count + new_count;
            let value = (e * existing_count as f64 + n * new_count as f64) / total as f64;
            (Some(round2(value)), total)
        }
        (Some(e), _) => (Some(e), existing_count),
        (None, Some(n)) => (Some(n), new_count),
        (None, None) => (None, 0),
    }
}

/// Per-device monthly CSV files with one row per hour
pub struct TimeSeriesStore {
    dir: PathBuf,
    /// Cumulative sample counts of rows written during this run
    ledger: HashMap<(FileKey, i64), SampleCounts>,
}

impl TimeSeriesStore {
    /// Create a store writing into `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        info!("Time-series store at {}", dir.display());
        Self {
            dir,
            ledger: HashMap::new(),
        }
    }

    /// Path of the file for `key`
    pub fn path_for(&self, key: &FileKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Append the row, or merge it into the existing row for the same hour.
    ///
    /// Merges weight each side by its sample count. Counts of rows written
    /// by this store are remembered for the life of the process; a row found
    /// on disk with no remembered count (e.g. written before a restart)
    /// counts as a single sample.
    pub fn write_or_merge(
        &mut self,
        key: &FileKey,
        row: &PersistedRow,
        counts: SampleCounts,
    ) -> Result<WriteOutcome, StorageError> {
        let path = self.path_for(key);
        let ledger_key = (*key, row.timestamp.timestamp());

        if !path.exists() {
            write_rows(&path, std::slice::from_ref(row))?;
            self.ledger.insert(ledger_key, counts);
            debug!("Created {} with row {}", path.display(), row.time_label());
            return Ok(WriteOutcome::Created);
        }

        let mut rows = read_rows(&path)?;
        match rows.iter_mut().find(|r| r.timestamp == row.timestamp) {
            Some(existing) => {
                let prior = self
                    .ledger
                    .get(&ledger_key)
                    .copied()
                    .unwrap_or_else(|| SampleCounts::assumed(existing));
                let (merged, total) = merge_rows(existing, prior, row, counts);
                *existing = merged;

                write_rows(&path, &rows)?;
                self.ledger.insert(ledger_key, total);
                debug!("Merged row {} in {}", row.time_label(), path.display());
                Ok(WriteOutcome::Merged)
            }
            None => {
                append_row(&path, row)?;
                self.ledger.insert(ledger_key, counts);
                debug!("Appended row {} to {}", row.time_label(), path.display());
                Ok(WriteOutcome::Appended)
            }
        }
    }

    /// All rows of the file for `key`; empty when the file does not exist
    pub fn rows(&self, key: &FileKey) -> Result<Vec<PersistedRow>, StorageError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_rows(&path)
    }
}

fn csv_error(path: &Path, err: csv::Error) -> StorageError {
    let line = err.position().map(|p| p.line() as usize).unwrap_or(0);
    let reason = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(e) => StorageError::io(path, e),
        _ => StorageError::Corrupt {
            path: path.display().to_string(),
            line,
            reason,
        },
    }
}

fn read_rows(path: &Path) -> Result<Vec<PersistedRow>, StorageError> {
    let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    reader
        .deserialize::<PersistedRow>()
        .map(|result| result.map_err(|e| csv_error(path, e)))
        .collect()
}

/// Replace the file with a header and `rows`
fn write_rows(path: &Path, rows: &[PersistedRow]) -> Result<(), StorageError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).map_err(|e| csv_error(path, e))?;
    }
    let contents = writer
        .into_inner()
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;
    write_atomic(path, &contents)
}

fn append_row(path: &Path, row: &PersistedRow) -> Result<(), StorageError> {
    let file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| StorageError::io(path, e))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.serialize(row).map_err(|e| csv_error(path, e))?;
    writer.flush().map_err(|e| StorageError::io(path, e))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn hour(month: u32, day: u32, h: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, month, day, h, 0, 0)
            .unwrap()
    }

    fn row(ts: DateTime<FixedOffset>, t: Option<f64>, h: Option<f64>) -> PersistedRow {
        PersistedRow {
            timestamp: ts,
            device_temperature: t,
            device_humidity: h,
            climate_temperature: Some(30.0),
            climate_humidity: Some(0.7),
        }
    }

    fn counts(n: usize) -> SampleCounts {
        SampleCounts {
            temperature: n,
            humidity: n,
        }
    }

    #[test]
    fn test_file_key_name() {
        let key = FileKey::for_hour(3, &hour(6, 1, 9));
        assert_eq!(key.file_name(), "device_3_temperature_data_2024-06.csv");
    }

    #[test]
    fn test_time_label_format() {
        let r = row(hour(6, 1, 9), None, None);
        assert_eq!(r.time_label(), "2024-06-01T09:00:00.000+08:00");
    }

    #[test]
    fn test_create_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TimeSeriesStore::new(dir.path());
        let key = FileKey::for_hour(1, &hour(6, 1, 9));

        let first = store
            .write_or_merge(&key, &row(hour(6, 1, 9), Some(25.0), Some(0.55)), counts(2))
            .unwrap();
        let second = store
            .write_or_merge(&key, &row(hour(6, 1, 10), None, None), counts(0))
            .unwrap();

        assert_eq!(first, WriteOutcome::Created);
        assert_eq!(second, WriteOutcome::Appended);

        let text = fs::read_to_string(store.path_for(&key)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "2024-06-01T09:00:00.000+08:00,25.00,0.55,30.00,0.70");
        assert_eq!(lines[2], "2024-06-01T10:00:00.000+08:00,,,30.00,0.70");
    }

    #[test]
    fn test_second_write_same_hour_merges_weighted() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TimeSeriesStore::new(dir.path());
        let key = FileKey::for_hour(1, &hour(6, 1, 9));

        // 3 readings averaging 24.0, then 1 reading of 28.0
        store
            .write_or_merge(&key, &row(hour(6, 1, 9), Some(24.0), Some(0.5)), counts(3))
            .unwrap();
        let outcome = store
            .write_or_merge(&key, &row(hour(6, 1, 9), Some(28.0), Some(0.9)), counts(1))
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Merged);
        let rows = store.rows(&key).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_temperature, Some(25.0));
        assert_eq!(rows[0].device_humidity, Some(0.6));
    }

    #[test]
    fn test_repeated_merges_are_a_running_average() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TimeSeriesStore::new(dir.path());
        let key = FileKey::for_hour(1, &hour(6, 1, 9));

        for value in [20.0, 22.0, 24.0, 26.0] {
            store
                .write_or_merge(&key, &row(hour(6, 1, 9), Some(value), None), counts(1))
                .unwrap();
        }
        let rows = store.rows(&key).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_temperature, Some(23.0));
    }

    #[test]
    fn test_merge_keeps_existing_when_new_is_empty() {
        let existing = row(hour(6, 1, 9), Some(25.0), Some(0.55));
        let mut empty = row(hour(6, 1, 9), None, None);
        empty.climate_temperature = None;
        empty.climate_humidity = Some(0.8);

        let (merged, total) = merge_rows(&existing, counts(4), &empty, counts(0));
        assert_eq!(merged.device_temperature, Some(25.0));
        assert_eq!(merged.device_humidity, Some(0.55));
        assert_eq!(merged.climate_temperature, Some(30.0));
        assert_eq!(merged.climate_humidity, Some(0.8));
        assert_eq!(total, counts(4));
    }

    #[test]
    fn test_merge_after_restart_weights_disk_row_as_one() {
        let dir = tempfile::tempdir().unwrap();
        let key = FileKey::for_hour(1, &hour(6, 1, 9));
        {
            let mut store = TimeSeriesStore::new(dir.path());
            store
                .write_or_merge(&key, &row(hour(6, 1, 9), Some(20.0), None), counts(10))
                .unwrap();
        }
        let mut restarted = TimeSeriesStore::new(dir.path());
        restarted
            .write_or_merge(&key, &row(hour(6, 1, 9), Some(30.0), None), counts(1))
            .unwrap();
        assert_eq!(restarted.rows(&key).unwrap()[0].device_temperature, Some(25.0));
    }

    #[test]
    fn test_month_rotation_uses_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TimeSeriesStore::new(dir.path());
        let june = FileKey::for_hour(1, &hour(6, 30, 23));
        let july = FileKey::for_hour(1, &hour(7, 1, 0));

        store
            .write_or_merge(&june, &row(hour(6, 30, 23), Some(25.0), None), counts(1))
            .unwrap();
        let outcome = store
            .write_or_merge(&july, &row(hour(7, 1, 0), Some(26.0), None), counts(1))
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Created);
        assert_eq!(store.rows(&june).unwrap().len(), 1);
        assert_eq!(store.rows(&july).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TimeSeriesStore::new(dir.path());
        let key = FileKey::for_hour(1, &hour(6, 1, 9));
        fs::write(store.path_for(&key), format!("{}\nnot,a,row\n", CSV_HEADER)).unwrap();

        let result = store.write_or_merge(&key, &row(hour(6, 1, 9), Some(1.0), None), counts(1));
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn test_bad_value_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::new(dir.path());
        let key = FileKey::for_hour(1, &hour(6, 1, 9));
        fs::write(
            store.path_for(&key),
            format!("{}\n2024-06-01T09:00:00.000+08:00,warm,,,\n", CSV_HEADER),
        )
        .unwrap();

        match store.rows(&key) {
            Err(StorageError::Corrupt { reason, .. }) => assert!(reason.contains("warm")),
            other => panic!("expected corrupt file, got {:?}", other),
        }
    }

    #[test]
    fn test_columns_read_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::new(dir.path());
        let key = FileKey::for_hour(1, &hour(6, 1, 9));
        fs::write(
            store.path_for(&key),
            "device_humidity,time,device_temperature,climate_humidity,climate_temperature\n\
             0.55,2024-06-01T09:00:00.000+08:00,25.00,nan,\n",
        )
        .unwrap();

        let rows = store.rows(&key).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, hour(6, 1, 9));
        assert_eq!(rows[0].device_temperature, Some(25.0));
        assert_eq!(rows[0].device_humidity, Some(0.55));
        assert_eq!(rows[0].climate_temperature, None);
        assert_eq!(rows[0].climate_humidity, None);
    }
}
