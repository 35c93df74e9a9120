//! Time-to-live Climate Cache

use crate::provider::ClimateProvider;
use crate::{ClimateConfig, ClimateReading};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Receives every freshly fetched reading
pub trait ClimateObserver: Send + Sync {
    fn observe(&self, reading: ClimateReading);
}

#[derive(Debug, Default)]
struct CacheState {
    /// Last known good reading
    last_good: Option<ClimateReading>,
    /// When `last_good` was fetched
    refreshed_at: Option<Instant>,
    /// When the last fetch failed
    failed_at: Option<Instant>,
}

/// Climate cache with last-known-good fallback
pub struct ClimateCache {
    provider: Arc<dyn ClimateProvider>,
    ttl: Duration,
    failure_backoff: Duration,
    state: Mutex<CacheState>,
    observer: Option<Arc<dyn ClimateObserver>>,
}

impl ClimateCache {
    /// Create a cache with the given time-to-live
    pub fn new(provider: Arc<dyn ClimateProvider>, ttl: Duration) -> Self {
        info!(
            "Creating climate cache: provider={}, ttl={}s",
            provider.name(),
            ttl.as_secs()
        );
        Self {
            provider,
            ttl,
            failure_backoff: Duration::ZERO,
            state: Mutex::new(CacheState::default()),
            observer: None,
        }
    }

    /// Create a cache from configuration
    pub fn from_config(provider: Arc<dyn ClimateProvider>, config: &ClimateConfig) -> Self {
        Self::new(provider, Duration::from_secs(config.ttl_seconds))
            .with_failure_backoff(Duration::from_secs(config.failure_backoff_seconds))
    }

    /// Do not retry a failed fetch before this much time has passed
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Register the observer notified on every successful refresh
    pub fn with_observer(mut self, observer: Arc<dyn ClimateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current reading, refreshing it first when older than the TTL.
    ///
    /// Returns the previous reading (possibly `None`) when the refresh fails.
    pub async fn get(&self) -> Option<ClimateReading> {
        let mut state = self.state.lock().await;

        if let Some(refreshed_at) = state.refreshed_at {
            if refreshed_at.elapsed() < self.ttl {
                return state.last_good;
            }
        }

        self.fetch(&mut state).await
    }

    /// Fetch a new reading regardless of its age.
    ///
    /// Still waits out the failure backoff; returns the previous reading when
    /// the fetch fails or is skipped.
    pub async fn refresh(&self) -> Option<ClimateReading> {
        let mut state = self.state.lock().await;
        self.fetch(&mut state).await
    }

    async fn fetch(&self, state: &mut CacheState) -> Option<ClimateReading> {
        if let Some(failed_at) = state.failed_at {
            if failed_at.elapsed() < self.failure_backoff {
                debug!("Climate fetch backing off after failure");
                return state.last_good;
            }
        }

        match self.provider.fetch().await {
            Ok(raw) => {
                let reading = ClimateReading::from_observation(raw, Utc::now());
                state.last_good = Some(reading);
                state.refreshed_at = Some(Instant::now());
                state.failed_at = None;
                info!(
                    "Climate data updated: temperature={:.2}, humidity={:.2}",
                    reading.temperature, reading.humidity
                );
                if let Some(observer) = &self.observer {
                    observer.observe(reading);
                }
            }
            Err(e) => {
                state.failed_at = Some(Instant::now());
                warn!(
                    "Climate fetch failed, serving last known value (degraded): {}",
                    e
                );
            }
        }

        state.last_good
    }

    /// Last known good reading without triggering a refresh
    pub async fn last_known(&self) -> Option<ClimateReading> {
        self.state.lock().await.last_good
    }
}
