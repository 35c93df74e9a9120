//! Alert Manager Implementation

use crate::{AlertEvent, AnomalyAlert};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Alert configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Number of recent anomalies kept for inspection
    pub history_limit: usize,
    /// Buffer of the subscriber broadcast channel
    pub channel_capacity: usize,
    /// Minimum time between recorded anomalies of one device (0 disables)
    pub cooldown_seconds: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            channel_capacity: 64,
            cooldown_seconds: 0,
        }
    }
}

#[derive(Debug, Default)]
struct AlertState {
    history: VecDeque<AnomalyAlert>,
    last_recorded: HashMap<String, Instant>,
    heartbeats: u64,
    anomalies: u64,
    suppressed: u64,
}

/// Alert manager shared between the scoring worker and the status API
pub struct AlertManager {
    config: AlertConfig,
    state: Mutex<AlertState>,
    sender: broadcast::Sender<AlertEvent>,
}

impl AlertManager {
    /// Create a new alert manager
    pub fn new(config: AlertConfig) -> Self {
        info!("Creating alert manager with config: {:?}", config);
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            config,
            state: Mutex::new(AlertState::default()),
            sender,
        }
    }

    /// Handle one scoring outcome
    pub fn emit(&self, event: AlertEvent) {
        let mut state = self.lock();

        match &event {
            AlertEvent::Anomaly(alert) => {
                state.anomalies += 1;
                counter!("telemetry_anomalies_total").increment(1);
                warn!(
                    "Anomaly detected on {} at {}: loss {:.4} > {:.2}",
                    alert.device, alert.timestamp, alert.loss, alert.threshold
                );

                let cooldown = Duration::from_secs(self.config.cooldown_seconds);
                let in_cooldown = state
                    .last_recorded
                    .get(&alert.device)
                    .is_some_and(|at| at.elapsed() < cooldown);
                if in_cooldown {
                    state.suppressed += 1;
                    debug!("Alert for {} suppressed: in cooldown period", alert.device);
                    return;
                }

                state.last_recorded.insert(alert.device.clone(), Instant::now());
                state.history.push_back(alert.clone());
                while state.history.len() > self.config.history_limit {
                    state.history.pop_front();
                }
            }
            AlertEvent::Heartbeat {
                device,
                timestamp,
                loss,
            } => {
                state.heartbeats += 1;
                counter!("telemetry_heartbeats_total").increment(1);
                debug!("Ping: no anomaly on {} at {} (loss {:.4})", device, timestamp, loss);
            }
        }
        drop(state);

        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Most recent anomalies, newest first
    pub fn recent(&self, limit: usize) -> Vec<AnomalyAlert> {
        self.lock().history.iter().rev().take(limit).cloned().collect()
    }

    /// Receive every subsequent event
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.sender.subscribe()
    }

    /// Number of readings scored within the threshold
    pub fn heartbeat_count(&self) -> u64 {
        self.lock().heartbeats
    }

    /// Number of anomalies seen, including suppressed ones
    pub fn anomaly_count(&self) -> u64 {
        self.lock().anomalies
    }

    /// Number of anomalies kept out of the history by the cooldown
    pub fn suppressed_count(&self) -> u64 {
        self.lock().suppressed
    }

    fn lock(&self) -> MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}
