//! MQTT publisher on top of `rumqttc`.
//!
//! The event loop runs in a background task. Connection state is tracked in a
//! `watch` channel so publishes can fail fast while the broker is away. The
//! bridge availability topic carries a retained `online` after every connect
//! and the broker publishes the retained `offline` last will if the bridge
//! vanishes.

use std::time::Duration;

use async_trait::async_trait;
use ensto_core::{
    Backoff, DeviceMetadata, DeviceStatus, MqttConfig, OutgoingMessage, PublishError,
    PublishResult, Publisher, Reading, TopicLayout,
};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Payload of the availability topic while the bridge runs.
pub const ONLINE: &str = "online";

/// Payload of the availability topic after the bridge stops.
pub const OFFLINE: &str = "offline";

const REQUEST_CAPACITY: usize = 64;
const RECONNECT: Backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

/// Broker options derived from configuration, including the last will.
#[must_use]
pub fn mqtt_options(config: &MqttConfig, layout: &TopicLayout) -> MqttOptions {
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("ensto-bridge-{}", std::process::id()));
    let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }
    options.set_last_will(LastWill::new(
        layout.availability_topic(),
        OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    options
}

/// [`Publisher`] sending to an MQTT broker.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    layout: TopicLayout,
    connected: watch::Receiver<bool>,
}

impl MqttPublisher {
    /// Create the client and spawn its event loop.
    ///
    /// The loop runs until `shutdown` flips to true, then publishes `offline`
    /// and disconnects.
    #[must_use]
    pub fn start(config: &MqttConfig, shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let layout = TopicLayout::new(&config.base_topic, &config.discovery_prefix);
        let options = mqtt_options(config, &layout);
        info!(
            broker = %config.broker,
            port = config.port,
            client_id = %options.client_id(),
            "Connecting to MQTT broker"
        );
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (connected_tx, connected) = watch::channel(false);

        let task = tokio::spawn(drive(
            event_loop,
            client.clone(),
            layout.availability_topic(),
            connected_tx,
            shutdown,
        ));

        (
            Self {
                client,
                layout,
                connected,
            },
            task,
        )
    }

    /// Wait up to `limit` for the first broker connection.
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let mut connected = self.connected.clone();
        tokio::time::timeout(limit, connected.wait_for(|up| *up))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    async fn send(&self, message: OutgoingMessage) -> PublishResult<()> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.client
            .publish(
                message.topic.clone(),
                QoS::AtLeastOnce,
                message.retain,
                message.payload,
            )
            .await
            .map_err(|e| PublishError::Rejected {
                topic: message.topic,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish_state(&self, identifier: &str, reading: &Reading) -> PublishResult<()> {
        let message = self.layout.state_message(identifier, reading)?;
        debug!(topic = %message.topic, "Publishing state");
        self.send(message).await
    }

    async fn publish_discovery(&self, identifier: &str, metadata: &DeviceMetadata) -> PublishResult<()> {
        for message in self.layout.discovery_messages(identifier, metadata) {
            self.send(message).await?;
        }
        info!(device = %identifier, "Published Home Assistant discovery");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn publish_status(&self, identifier: &str, status: &DeviceStatus) -> PublishResult<()> {
        let message = self.layout.status_message(identifier, status)?;
        self.send(message).await
    }
}

async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    availability_topic: String,
    connected: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures = 0u32;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    failures = 0;
                    info!("Connected to MQTT broker");
                    connected.send_replace(true);
                    if let Err(err) =
                        client.try_publish(&availability_topic, QoS::AtLeastOnce, true, ONLINE)
                    {
                        warn!(error = %err, "Failed to queue availability");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker closed the connection");
                    connected.send_replace(false);
                }
                Ok(_) => {}
                Err(err) => {
                    connected.send_replace(false);
                    failures = failures.saturating_add(1);
                    let delay = RECONNECT.delay(failures);
                    warn!(error = %err, retry_secs = delay.as_secs(), "MQTT connection error");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    if *connected.borrow() {
        let _ = client.try_publish(&availability_topic, QoS::AtLeastOnce, true, OFFLINE);
        let _ = client.try_disconnect();
        // Flush the queued requests.
        let flush = async {
            while event_loop.poll().await.is_ok() {}
        };
        let _ = tokio::time::timeout(Duration::from_secs(2), flush).await;
    }
    connected.send_replace(false);
    info!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> MqttConfig {
        MqttConfig {
            broker: "127.0.0.1".to_string(),
            port: 1,
            client_id: Some("ensto-test".to_string()),
            ..MqttConfig::default()
        }
    }

    #[test]
    fn test_options_carry_last_will() {
        let layout = TopicLayout::default();
        let options = mqtt_options(&config(), &layout);
        assert_eq!(options.client_id(), "ensto-test");
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 1));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));

        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "ensto_bridge/status");
        assert_eq!(&will.message[..], OFFLINE.as_bytes());
        assert!(will.retain);
    }

    #[test]
    fn test_generated_client_id() {
        let mut config = config();
        config.client_id = None;
        let options = mqtt_options(&config, &TopicLayout::default());
        assert!(options.client_id().starts_with("ensto-bridge-"));
    }

    #[tokio::test]
    async fn test_publish_fails_fast_when_disconnected() {
        let (tx, rx) = watch::channel(false);
        let (publisher, task) = MqttPublisher::start(&config(), rx);
        assert!(!publisher.is_connected());

        let reading = Reading {
            target_temperature: 21.5,
            room_temperature: 20.3,
            floor_temperature: 22.1,
            relay_active: true,
            timestamp: Utc::now(),
        };
        let err = publisher
            .publish_state("AA:BB:CC:DD:EE:FF", &reading)
            .await
            .unwrap_err();
        assert_eq!(err, PublishError::NotConnected);

        tx.send(true).unwrap();
        tokio_test::assert_ok!(task.await);
    }
}
