//! MQTT Connection Manager

use crate::backoff::BackoffPolicy;
use crate::message::{decode_payload, device_from_topic, Reading};
use crate::{DecodeError, IngestConfig, IngestError};
use chrono::{DateTime, FixedOffset, Utc};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial handshake in progress
    Connecting,
    /// Handshake complete, subscription issued
    Connected,
    /// Connection lost; retrying
    Reconnecting { attempt: u32 },
    /// Manager has shut down
    Stopped,
}

impl ConnectionState {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Stopped => "stopped",
        }
    }
}

/// Result of dispatching one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Reading handed to the worker queue
    Enqueued,
    /// Topic carries no device telemetry
    Ignored,
    /// Payload failed to decode
    Rejected(DecodeError),
    /// Queue full; reading dropped
    Dropped,
    /// Queue receiver gone
    Closed,
}

/// Turns inbound publishes into readings on the worker queue
#[derive(Debug, Clone)]
pub struct MessageRouter {
    reserved_segment: String,
    offset: FixedOffset,
}

impl MessageRouter {
    /// Create a router stamping readings in the given UTC offset
    pub fn new(reserved_segment: &str, offset: FixedOffset) -> Self {
        Self {
            reserved_segment: reserved_segment.to_string(),
            offset,
        }
    }

    /// Decode and enqueue one message stamped with the current time. Never
    /// blocks; a full queue drops the reading.
    pub fn dispatch(
        &self,
        topic: &str,
        payload: &[u8],
        queue: &mpsc::Sender<Reading>,
    ) -> DispatchOutcome {
        let observed_at = Utc::now().with_timezone(&self.offset);
        self.dispatch_at(topic, payload, observed_at, queue)
    }

    /// Decode and enqueue one message observed at `observed_at`
    pub fn dispatch_at(
        &self,
        topic: &str,
        payload: &[u8],
        observed_at: DateTime<FixedOffset>,
        queue: &mpsc::Sender<Reading>,
    ) -> DispatchOutcome {
        let Some(device) = device_from_topic(topic, &self.reserved_segment) else {
            debug!("Ignoring non-device topic {}", topic);
            return DispatchOutcome::Ignored;
        };

        metrics::counter!("telemetry_messages_received_total").increment(1);

        let reading = match decode_payload(device, payload, observed_at) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Dropping message from {}: {}", device, e);
                metrics::counter!("telemetry_decode_failures_total").increment(1);
                return DispatchOutcome::Rejected(e);
            }
        };

        match queue.try_send(reading) {
            Ok(()) => DispatchOutcome::Enqueued,
            Err(mpsc::error::TrySendError::Full(reading)) => {
                warn!(
                    "Reading queue full, dropping reading from {}",
                    reading.device
                );
                metrics::counter!("telemetry_readings_dropped_total").increment(1);
                DispatchOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => DispatchOutcome::Closed,
        }
    }
}

/// MQTT connection manager
pub struct ConnectionManager {
    config: IngestConfig,
    router: MessageRouter,
    backoff: BackoffPolicy,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Create new connection manager
    pub fn new(config: IngestConfig, offset: FixedOffset) -> Self {
        let router = MessageRouter::new(&config.reserved_segment, offset);
        let backoff = BackoffPolicy::from_config(&config.backoff);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            config,
            router,
            backoff,
            state_tx,
        }
    }

    /// Override the reconnect policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Subscribe to connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Wildcard subscription covering the whole namespace
    pub fn topic_filter(&self) -> String {
        format!("{}/#", self.config.namespace)
    }

    fn mqtt_options(&self) -> MqttOptions {
        let client_id = self.config.client_id.clone().unwrap_or_else(|| {
            let id = Uuid::new_v4().simple().to_string();
            format!("telemetry-{}", &id[..12])
        });
        let mut options = MqttOptions::new(
            client_id,
            &self.config.broker_host,
            self.config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_seconds));
        options.set_clean_session(true);
        options
    }

    fn set_state(&self, state: ConnectionState) {
        metrics::gauge!("telemetry_mqtt_connected").set(if state == ConnectionState::Connected {
            1.0
        } else {
            0.0
        });
        self.state_tx.send_replace(state);
    }

    fn subscribe(&self, client: &AsyncClient) -> Result<(), IngestError> {
        let filter = self.topic_filter();
        client
            .try_subscribe(filter.as_str(), QoS::AtMostOnce)
            .map_err(|e| IngestError::Subscribe(e.to_string()))?;
        info!("Subscribed to {}", filter);
        Ok(())
    }

    /// Run the transport until shutdown.
    ///
    /// Connection failures are retried per the backoff policy; while a retry
    /// is pending no messages are received, so publishes during that window
    /// are lost. Returns an error only when a finite retry budget runs out.
    pub async fn run(
        self,
        queue: mpsc::Sender<Reading>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), IngestError> {
        info!(
            "Connecting to MQTT broker {}:{}",
            self.config.broker_host, self.config.broker_port
        );
        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), 10);
        let mut attempt: u32 = 0;
        let mut ever_connected = false;
        let mut result = Ok(());

        self.set_state(ConnectionState::Connecting);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            warn!("Broker refused connection: {:?}", ack.code);
                            continue;
                        }
                        if ever_connected {
                            info!("Reconnected to MQTT broker after {} attempts", attempt);
                        } else {
                            info!("Connected to MQTT broker");
                        }
                        attempt = 0;
                        ever_connected = true;
                        self.set_state(ConnectionState::Connected);
                        if let Err(e) = self.subscribe(&client) {
                            error!("{}", e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let outcome = self.router.dispatch(&publish.topic, &publish.payload[..], &queue);
                        if outcome == DispatchOutcome::Closed {
                            info!("Reading queue closed, stopping transport");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        attempt += 1;
                        if self.backoff.exhausted(attempt) {
                            error!("MQTT connection failed {} times, giving up: {}", attempt, e);
                            result = Err(IngestError::RetriesExhausted(attempt));
                            break;
                        }

                        let delay = self.backoff.delay(attempt);
                        if ever_connected {
                            warn!("Unexpected disconnection (attempt {}): {}. Retrying in {:?}", attempt, e, delay);
                            self.set_state(ConnectionState::Reconnecting { attempt });
                        } else {
                            warn!("Connection failed (attempt {}): {}. Retrying in {:?}", attempt, e, delay);
                            self.set_state(ConnectionState::Connecting);
                        }

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        if ever_connected {
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request failed: {}", e);
            }
            // Drive the event loop until the disconnect is written out.
            let _ = tokio::time::timeout(Duration::from_secs(1), async {
                while eventloop.poll().await.is_ok() {}
            })
            .await;
        }

        self.set_state(ConnectionState::Stopped);
        info!("MQTT transport stopped");
        result
    }
}
