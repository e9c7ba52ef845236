use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, Notify};

use crate::config::MqttConfig;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// A decoded inbound publish, handed to the ingestor as-is. JSON decoding
/// happens downstream so a bad payload can never take the session down.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: SystemTime,
}

/// Outbound seam shared by the ingestor (balance-updated events) and the
/// command relay. The MQTT session implements it; tests inject fakes.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Owns the broker connection for both directions.
///
/// A single supervised task drives the event loop: on every ConnAck it
/// re-subscribes the fixed topic set, forwards inbound publishes to the
/// ingestor channel, and on any connection error backs off and polls again.
/// A failure before the first ConnAck waits `connect_retry_secs`; a
/// mid-session drop waits `loop_retry_secs`. The loop never ends the
/// process; it runs until `shutdown` is signalled.
#[derive(Clone)]
pub struct MqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl MqttSession {
    pub fn start(
        cfg: &MqttConfig,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));

        let (client, eventloop) = AsyncClient::new(options, cfg.channel_capacity);

        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let session = Self {
            client: client.clone(),
            connected: connected.clone(),
            shutdown: shutdown.clone(),
        };

        let subscriptions = vec![cfg.telemetry_topic.clone(), cfg.relay_topic.clone()];
        let task = tokio::spawn(run_session(
            client,
            eventloop,
            subscriptions,
            inbound_tx,
            connected,
            shutdown,
            Duration::from_secs(cfg.connect_retry_secs),
            Duration::from_secs(cfg.loop_retry_secs),
        ));

        (session, task)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Ask the session loop to disconnect and exit. Closing the loop drops
    /// the inbound sender, which in turn lets the ingestor drain and stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

#[async_trait::async_trait]
impl Publisher for MqttSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable(
                "MQTT session is not connected".to_string(),
            ));
        }

        // Best-effort: hand the message to the client queue without waiting
        // for broker acknowledgment. Delivery is whatever QoS 1 gives us.
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    client: AsyncClient,
    mut eventloop: EventLoop,
    subscriptions: Vec<String>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    connect_retry: Duration,
    loop_retry: Duration,
) {
    let mut ever_connected = false;

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!("transport shutdown requested, disconnecting");
                connected.store(false, Ordering::Release);
                let _ = client.disconnect().await;
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected.store(true, Ordering::Release);
                    ever_connected = true;
                    tracing::info!("connected to MQTT broker");

                    // Session state on the broker is not assumed; resubscribe
                    // the full topic set after every (re)connect.
                    for topic in &subscriptions {
                        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            tracing::error!(error = %e, topic = %topic, "subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        received_at: SystemTime::now(),
                    };
                    if inbound_tx.send(msg).await.is_err() {
                        tracing::warn!("inbound channel closed, stopping transport loop");
                        let _ = client.disconnect().await;
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    connected.store(false, Ordering::Release);
                    let delay = if ever_connected { loop_retry } else { connect_retry };
                    metrics::counter!("transport_reconnects_total").increment(1);
                    tracing::warn!(
                        error = %e,
                        delay_secs = delay.as_secs(),
                        "MQTT connection error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records publishes for assertions.
    #[derive(Default)]
    pub struct RecordingPublisher {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl RecordingPublisher {
        pub fn published(&self) -> Vec<(String, Vec<u8>)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }

    /// Fails every publish, as a disconnected session would.
    pub struct DownPublisher;

    #[async_trait::async_trait]
    impl Publisher for DownPublisher {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), TransportError> {
            Err(TransportError::Unavailable(
                "MQTT session is not connected".to_string(),
            ))
        }
    }
}
