//! Periodic tasks driving the aggregator

use crate::actor::AggregatorHandle;
use crate::aggregator::{FlushReport, FlushTrigger};
use crate::bucket::hour_floor;
use crate::AggregatorError;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Utc};
use climate::ClimateCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info};

/// Past the top of the hour so `now` is unambiguously in the new hour
const HOUR_GRACE: Duration = Duration::from_millis(500);

/// Time left until the next `:00:00`
pub fn duration_until_next_hour(now: DateTime<FixedOffset>) -> Duration {
    (hour_floor(now) + ChronoDuration::hours(1) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Refresh climate (when a cache is configured) and run a flush.
///
/// Manual and final flushes go through here so they see the freshest
/// climate sample the cache can provide.
pub async fn trigger_flush(
    handle: &AggregatorHandle,
    climate: Option<&ClimateCache>,
    trigger: FlushTrigger,
    offset: FixedOffset,
) -> Result<FlushReport, AggregatorError> {
    if let Some(cache) = climate {
        cache.get().await;
    }
    let now = Utc::now().with_timezone(&offset);
    handle.flush(trigger, now).await
}

/// Flush at every top of the hour until `shutdown` flips to `true`
pub async fn run_hourly_flush(
    handle: AggregatorHandle,
    climate: Option<Arc<ClimateCache>>,
    offset: FixedOffset,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Hourly flush timer started");

    loop {
        let now = Utc::now().with_timezone(&offset);
        let wait = duration_until_next_hour(now) + HOUR_GRACE;
        debug!("Next scheduled flush in {}s", wait.as_secs());

        tokio::select! {
            _ = sleep(wait) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match trigger_flush(&handle, climate.as_deref(), FlushTrigger::Timer, offset).await {
            Ok(report) => debug!(
                "Scheduled flush of {} wrote {} rows",
                report.hour, report.rows_written
            ),
            Err(e) => {
                error!("Scheduled flush failed: {}", e);
                break;
            }
        }
    }

    info!("Hourly flush timer stopped");
}

/// Fetch a climate reading every `period` until `shutdown` flips to `true`.
///
/// Fetches bypass the cache TTL so the hour's climate log gains one sample
/// per period. Fresh readings reach the aggregator through the cache's
/// observer.
pub async fn run_climate_refresh(
    cache: Arc<ClimateCache>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Climate refresh started: every {}s", period.as_secs());
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if cache.refresh().await.is_none() {
                    debug!("No climate reading available yet");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Climate refresh stopped");
}
