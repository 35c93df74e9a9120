//! Hour Buckets

use chrono::{DateTime, Duration, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use storage::SampleCounts;

/// One bucketed reading (humidity as a 0-1 fraction)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

/// Readings of one device within the current hour, in arrival order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HourBucket {
    samples: Vec<Sample>,
}

impl HourBucket {
    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Mean temperature and mean humidity over the non-null values, with
    /// the number of values behind each
    pub fn averages(&self) -> (Option<f64>, Option<f64>, SampleCounts) {
        let (temperature, t_count) = mean(self.samples.iter().filter_map(|s| s.temperature));
        let (humidity, h_count) = mean(self.samples.iter().filter_map(|s| s.humidity));
        (
            temperature,
            humidity,
            SampleCounts {
                temperature: t_count,
                humidity: h_count,
            },
        )
    }
}

/// Arithmetic mean rounded to two decimals; `None` for no values
pub(crate) fn mean(values: impl Iterator<Item = f64>) -> (Option<f64>, usize) {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if count == 0 {
        (None, 0)
    } else {
        (Some(round2(sum / count as f64)), count)
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Truncate to the start of the hour
pub fn hour_floor(at: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let excess = Duration::seconds(i64::from(at.minute() * 60 + at.second()))
        + Duration::nanoseconds(i64::from(at.nanosecond()));
    at - excess
}
