//! Daemon wiring and lifecycle

use crate::settings::Settings;
use crate::{run_server, AppState, PipelineError};
use aggregator::{
    run_climate_refresh, run_hourly_flush, trigger_flush, AggregatorHandle, FlushTrigger,
    HourlyAggregator,
};
use alerting::AlertManager;
use chrono::{FixedOffset, Utc};
use climate::{ClimateCache, ClimateObserver, OpenWeatherProvider};
use feature_engine::MinMaxNormalizer;
use inference_engine::{AnomalyScorer, OnnxAutoencoder, ScoringWorker};
use ingest::{ConnectionManager, Reading};
use metrics_exporter_prometheus::PrometheusHandle;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use storage::{DeviceRegistry, TimeSeriesStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for the aggregator to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The assembled daemon
pub struct Pipeline {
    settings: Settings,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Build every component, run until a shutdown signal, then stop in
    /// order: timers and triggers, final flush, transport.
    pub async fn run(self, metrics: Option<PrometheusHandle>) -> Result<(), PipelineError> {
        let settings = self.settings;
        let offset = settings.offset()?;

        // Storage and aggregation
        let registry = DeviceRegistry::load(&settings.storage.registry_path)?;
        let store = TimeSeriesStore::new(&settings.storage.data_dir);
        let now = Utc::now().with_timezone(&offset);
        let aggregator = HourlyAggregator::new(registry, store, now, &settings.aggregator);
        let (handle, actor) = aggregator::spawn(aggregator, settings.aggregator.command_capacity);

        // Climate
        let climate = if settings.climate_enabled() {
            let provider = Arc::new(OpenWeatherProvider::new(&settings.climate)?);
            let observer: Arc<dyn ClimateObserver> = Arc::new(handle.clone());
            Some(Arc::new(
                ClimateCache::from_config(provider, &settings.climate).with_observer(observer),
            ))
        } else {
            warn!("No climate API key configured; rows will carry no climate data");
            None
        };

        // Scoring
        let alerts = Arc::new(AlertManager::new(settings.alerting.clone()));
        let (scoring, scoring_task) = if settings.scoring.enabled {
            let normalizer = MinMaxNormalizer::from_file(&settings.scoring.normalizer_path)?;
            let model = OnnxAutoencoder::load(&settings.scoring.model_path)?;
            let scorer = AnomalyScorer::new(normalizer, Box::new(model), settings.scoring.threshold);
            let (tx, worker) = ScoringWorker::channel(
                scorer,
                settings.scoring.queue_capacity,
                climate.clone(),
                alerts.clone(),
            );
            (Some(tx), Some(tokio::spawn(worker.run())))
        } else {
            info!("Anomaly scoring disabled");
            (None, None)
        };

        // Separate signals so the transport outlives the final flush
        let (timers_tx, timers_rx) = watch::channel(false);
        let (transport_tx, transport_rx) = watch::channel(false);

        // Ingestion
        let (reading_tx, reading_rx) = mpsc::channel(settings.mqtt.queue_capacity.max(1));
        let manager = ConnectionManager::new(settings.mqtt.clone(), offset);
        let connection = manager.state();
        let transport = tokio::spawn(manager.run(reading_tx, transport_rx));
        let dispatcher = tokio::spawn(run_dispatcher(reading_rx, handle.clone(), scoring));

        // Timers and triggers
        let mut background: Vec<JoinHandle<()>> = Vec::new();
        background.push(tokio::spawn(run_hourly_flush(
            handle.clone(),
            climate.clone(),
            offset,
            timers_rx.clone(),
        )));
        if let Some(cache) = &climate {
            background.push(tokio::spawn(run_climate_refresh(
                cache.clone(),
                Duration::from_secs(settings.climate.refresh_interval_seconds.max(1)),
                timers_rx.clone(),
            )));
        }
        if settings.manual_trigger.stdin {
            match spawn_stdin_lines() {
                Ok(lines) => background.push(tokio::spawn(run_manual_trigger(
                    lines,
                    handle.clone(),
                    climate.clone(),
                    offset,
                    timers_rx.clone(),
                ))),
                Err(e) => warn!("Manual trigger unavailable: {}", e),
            }
        }

        // Status API
        let server = if settings.api.enabled {
            let mut state = AppState::new(handle.clone(), climate.clone(), alerts.clone(), connection, offset);
            if let Some(metrics) = metrics {
                state = state.with_metrics(metrics);
            }
            let addr = settings.api.listen_addr.clone();
            let rx = timers_rx.clone();
            Some(tokio::spawn(async move {
                run_server(&addr, Arc::new(state), rx).await
            }))
        } else {
            None
        };

        info!("Pipeline running; press Enter to save, Ctrl+C to stop");
        shutdown_signal().await;

        // 1. timers and triggers
        let _ = timers_tx.send(true);
        for task in background {
            let _ = task.await;
        }
        if let Some(server) = server {
            match server.await {
                Ok(Err(e)) => error!("API server failed: {}", e),
                Err(e) => error!("API server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }

        // 2. final flush
        match trigger_flush(&handle, climate.as_deref(), FlushTrigger::Final, offset).await {
            Ok(report) => info!(
                "Final save of hour {}: {} rows written, {} pending",
                report.hour, report.rows_written, report.rows_pending
            ),
            Err(e) => error!("Final save failed: {}", e),
        }

        // 3. transport
        let _ = transport_tx.send(true);
        match transport.await {
            Ok(Err(e)) => error!("Transport stopped with error: {}", e),
            Err(e) => error!("Transport task failed: {}", e),
            Ok(Ok(())) => {}
        }
        let _ = dispatcher.await;
        if let Some(task) = scoring_task {
            let _ = task.await;
        }

        drop(climate);
        drop(handle);
        match tokio::time::timeout(DRAIN_TIMEOUT, actor).await {
            Ok(Ok(aggregator)) if aggregator.pending_rows() > 0 => warn!(
                "{} rows could not be persisted before exit",
                aggregator.pending_rows()
            ),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Aggregator task failed: {}", e),
            Err(_) => warn!("Aggregator did not stop within {}s", DRAIN_TIMEOUT.as_secs()),
        }

        info!("Pipeline stopped");
        Ok(())
    }
}

/// Drain the reading queue into the aggregator, offering each reading to
/// the scoring worker first
pub async fn run_dispatcher(
    mut readings: mpsc::Receiver<Reading>,
    aggregator: AggregatorHandle,
    scoring: Option<mpsc::Sender<Reading>>,
) {
    info!("Dispatcher started");

    while let Some(reading) = readings.recv().await {
        if let Some(tx) = &scoring {
            ScoringWorker::offer(tx, reading.clone());
        }
        if let Err(e) = aggregator.record(reading).await {
            error!("Aggregator unavailable, dispatcher stopping: {}", e);
            break;
        }
    }

    info!("Dispatcher stopped");
}

/// Read standard input lines on a dedicated thread
pub fn spawn_stdin_lines() -> std::io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(4);
    std::thread::Builder::new()
        .name("stdin-trigger".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

/// Flush on every empty input line until `shutdown` flips to `true`
pub async fn run_manual_trigger(
    mut lines: mpsc::Receiver<String>,
    handle: AggregatorHandle,
    climate: Option<Arc<ClimateCache>>,
    offset: FixedOffset,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) if line.trim().is_empty() => {
                    info!("Manual save requested");
                    match trigger_flush(&handle, climate.as_deref(), FlushTrigger::Manual, offset).await {
                        Ok(report) => info!(
                            "Manual save of hour {}: {} rows written, {} pending",
                            report.hour, report.rows_written, report.rows_pending
                        ),
                        Err(e) => {
                            error!("Manual save failed: {}", e);
                            break;
                        }
                    }
                }
                Some(line) => debug!("Ignoring input {:?}", line),
                None => {
                    debug!("Standard input closed");
                    break;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Graceful shutdown signal handler
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
