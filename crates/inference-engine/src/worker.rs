//! Scoring Worker

use alerting::{AlertEvent, AlertManager, AnomalyAlert};
use climate::ClimateCache;
use ingest::Reading;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::scorer::{AnomalyScorer, Assessment, Verdict};

/// Scores readings from its own queue and reports each verdict
pub struct ScoringWorker {
    /// Channel receiver for readings to score
    receiver: mpsc::Receiver<Reading>,
    scorer: AnomalyScorer,
    climate: Option<Arc<ClimateCache>>,
    alerts: Arc<AlertManager>,
}

impl ScoringWorker {
    /// Create a worker and the sender feeding it
    pub fn channel(
        scorer: AnomalyScorer,
        capacity: usize,
        climate: Option<Arc<ClimateCache>>,
        alerts: Arc<AlertManager>,
    ) -> (mpsc::Sender<Reading>, Self) {
        let (tx, receiver) = mpsc::channel(capacity.max(1));
        info!("Creating scoring worker: queue={}", capacity);
        (
            tx,
            Self {
                receiver,
                scorer,
                climate,
                alerts,
            },
        )
    }

    /// Queue a reading without waiting; full queues drop the reading
    pub fn offer(sender: &mpsc::Sender<Reading>, reading: Reading) -> bool {
        match sender.try_send(reading) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(reading)) => {
                counter!("telemetry_scoring_dropped_total").increment(1);
                warn!("Scoring queue full, skipping reading from {}", reading.device);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Run until every sender is dropped
    pub async fn run(mut self) {
        info!("Starting scoring worker");

        while let Some(reading) = self.receiver.recv().await {
            let climate = match &self.climate {
                Some(cache) => cache.get().await,
                None => None,
            };

            match self.scorer.assess(&reading, climate) {
                Ok(Verdict::Scored(assessment)) => self.alerts.emit(to_event(assessment)),
                Ok(Verdict::Dropped(_)) => {
                    counter!("telemetry_scoring_skipped_total").increment(1);
                }
                Err(e) => {
                    counter!("telemetry_scoring_failures_total").increment(1);
                    error!("Scoring failed for {}: {}", reading.device, e);
                }
            }
        }

        debug!("Scoring channel closed");
        info!("Scoring worker stopped");
    }
}

fn to_event(assessment: Assessment) -> AlertEvent {
    if assessment.score.is_anomaly {
        AlertEvent::Anomaly(AnomalyAlert {
            device: assessment.device,
            timestamp: assessment.timestamp,
            loss: assessment.score.loss,
            threshold: assessment.score.threshold,
        })
    } else {
        AlertEvent::Heartbeat {
            device: assessment.device,
            timestamp: assessment.timestamp,
            loss: assessment.score.loss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::tests::{climate, reading, scorer};
    use async_trait::async_trait;
    use ::climate::{ClimateError, ClimateProvider, RawObservation};
    use std::time::Duration;

    struct FixedProvider;

    #[async_trait]
    impl ClimateProvider for FixedProvider {
        async fn fetch(&self) -> Result<RawObservation, ClimateError> {
            Ok(RawObservation {
                temperature: 29.0,
                humidity_percent: 80.0,
            })
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[tokio::test]
    async fn test_worker_emits_alert_and_heartbeat() {
        let alerts = Arc::new(AlertManager::default());
        let mut events = alerts.subscribe();
        let mut scorer = scorer();
        // seed the scorer's fallback climate
        scorer
            .assess(&reading("warmup", Some(25.0), Some(60.0)), Some(climate()))
            .unwrap();

        let (tx, worker) = ScoringWorker::channel(scorer, 8, None, alerts.clone());
        let task = tokio::spawn(worker.run());

        assert!(ScoringWorker::offer(&tx, reading("sensor-A", Some(50.0), Some(60.0))));
        assert!(ScoringWorker::offer(&tx, reading("sensor-A", Some(25.0), Some(60.0))));
        drop(tx);
        task.await.unwrap();

        assert!(events.recv().await.unwrap().is_anomaly());
        assert!(!events.recv().await.unwrap().is_anomaly());
        assert_eq!(alerts.recent(10).len(), 1);
        assert_eq!(alerts.heartbeat_count(), 1);
    }

    #[tokio::test]
    async fn test_worker_fetches_climate_from_cache() {
        let alerts = Arc::new(AlertManager::default());
        let cache = Arc::new(ClimateCache::new(Arc::new(FixedProvider), Duration::from_secs(600)));

        let (tx, worker) = ScoringWorker::channel(scorer(), 8, Some(cache), alerts.clone());
        let task = tokio::spawn(worker.run());

        ScoringWorker::offer(&tx, reading("sensor-A", Some(25.0), Some(60.0)));
        drop(tx);
        task.await.unwrap();

        assert_eq!(alerts.heartbeat_count(), 1);
    }

    #[tokio::test]
    async fn test_unscorable_reading_emits_nothing() {
        let alerts = Arc::new(AlertManager::default());
        let (tx, worker) = ScoringWorker::channel(scorer(), 8, None, alerts.clone());
        let task = tokio::spawn(worker.run());

        ScoringWorker::offer(&tx, reading("sensor-A", Some(25.0), Some(60.0)));
        drop(tx);
        task.await.unwrap();

        assert_eq!(alerts.heartbeat_count(), 0);
        assert_eq!(alerts.anomaly_count(), 0);
    }

    #[tokio::test]
    async fn test_offer_drops_when_full() {
        let alerts = Arc::new(AlertManager::default());
        let (tx, _worker) = ScoringWorker::channel(scorer(), 1, None, alerts);

        assert!(ScoringWorker::offer(&tx, reading("sensor-A", Some(25.0), Some(60.0))));
        assert!(!ScoringWorker::offer(&tx, reading("sensor-A", Some(25.0), Some(60.0))));
    }
}
