//! Publisher contract and MQTT payload construction.
//!
//! The session hands decoded readings to a [`Publisher`]. Topic and payload
//! layout is defined here so every publisher implementation emits the same
//! messages:
//!
//! ```text
//! ensto_bridge/<address>/state                          reading (JSON)
//! ensto_bridge/<address>/status                         session status (JSON, retained)
//! homeassistant/sensor/ensto_<node>/room_temp/config    discovery (retained)
//! homeassistant/sensor/ensto_<node>/floor_temp/config
//! homeassistant/sensor/ensto_<node>/target_temp/config
//! homeassistant/binary_sensor/ensto_<node>/relay/config
//! ```
//!
//! `<node>` is the address with separators removed, since Home Assistant
//! only accepts `[a-zA-Z0-9_-]` in discovery node ids.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::{DeviceMetadata, DeviceStatus, Reading};

/// Default root of the bridge's own topics.
pub const DEFAULT_BASE_TOPIC: &str = "ensto_bridge";

/// Default Home Assistant discovery prefix.
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

/// Publishing failures. Never fatal to a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The broker connection is down.
    #[error("MQTT client is not connected")]
    NotConnected,

    /// The client refused the message (queue full, client closed).
    #[error("Publish to '{topic}' failed: {message}")]
    Rejected {
        /// Target topic.
        topic: String,
        /// Client-provided reason.
        message: String,
    },

    /// Payload serialization failed.
    #[error("Failed to serialize payload: {0}")]
    Serialize(String),
}

/// Result alias for publishing.
pub type PublishResult<T> = std::result::Result<T, PublishError>;

/// Sink for readings and discovery descriptors.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one reading to the device's state topic.
    async fn publish_state(&self, identifier: &str, reading: &Reading) -> PublishResult<()>;

    /// Publish the Home Assistant discovery descriptors for a device.
    async fn publish_discovery(&self, identifier: &str, metadata: &DeviceMetadata) -> PublishResult<()>;

    /// Whether the broker connection is currently up.
    fn is_connected(&self) -> bool;

    /// Publish a session status snapshot. Optional.
    async fn publish_status(&self, _identifier: &str, _status: &DeviceStatus) -> PublishResult<()> {
        Ok(())
    }
}

/// An MQTT message ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Target topic.
    pub topic: String,
    /// JSON payload.
    pub payload: String,
    /// Whether the broker should keep it for late subscribers.
    pub retain: bool,
}

/// Strip separators so the address is usable as a Home Assistant node id.
#[must_use]
pub fn node_id(identifier: &str) -> String {
    identifier
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Body of the state topic. Field order is part of the wire format.
#[derive(Debug, Clone, Serialize)]
pub struct StatePayload {
    /// Calibrated target temperature.
    pub target_temperature: f64,
    /// Room temperature.
    pub room_temperature: f64,
    /// Floor temperature.
    pub floor_temperature: f64,
    /// Relay state.
    pub relay_active: bool,
}

impl From<&Reading> for StatePayload {
    fn from(reading: &Reading) -> Self {
        Self {
            target_temperature: reading.target_temperature,
            room_temperature: reading.room_temperature,
            floor_temperature: reading.floor_temperature,
            relay_active: reading.relay_active,
        }
    }
}

/// Builds topics and payloads under configurable prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    base_topic: String,
    discovery_prefix: String,
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC, DEFAULT_DISCOVERY_PREFIX)
    }
}

struct SensorEntity {
    component: &'static str,
    metric: &'static str,
    name: &'static str,
    field: &'static str,
}

const ENTITIES: [SensorEntity; 4] = [
    SensorEntity {
        component: "sensor",
        metric: "room_temp",
        name: "Room Temperature",
        field: "room_temperature",
    },
    SensorEntity {
        component: "sensor",
        metric: "floor_temp",
        name: "Floor Temperature",
        field: "floor_temperature",
    },
    SensorEntity {
        component: "sensor",
        metric: "target_temp",
        name: "Target Temperature",
        field: "target_temperature",
    },
    SensorEntity {
        component: "binary_sensor",
        metric: "relay",
        name: "Relay Active",
        field: "relay_active",
    },
];

impl TopicLayout {
    /// Layout rooted at `base_topic` with discovery under `discovery_prefix`.
    #[must_use]
    pub fn new(base_topic: &str, discovery_prefix: &str) -> Self {
        Self {
            base_topic: base_topic.trim_end_matches('/').to_string(),
            discovery_prefix: discovery_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// `ensto_bridge/<address>/state`
    #[must_use]
    pub fn state_topic(&self, identifier: &str) -> String {
        format!("{}/{identifier}/state", self.base_topic)
    }

    /// `ensto_bridge/<address>/status`
    #[must_use]
    pub fn status_topic(&self, identifier: &str) -> String {
        format!("{}/{identifier}/status", self.base_topic)
    }

    /// Bridge-wide availability topic, `ensto_bridge/status`.
    #[must_use]
    pub fn availability_topic(&self) -> String {
        format!("{}/status", self.base_topic)
    }

    /// State message for a reading. Pure: the same reading always yields the
    /// same message.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Serialize`] if the payload cannot be encoded.
    pub fn state_message(&self, identifier: &str, reading: &Reading) -> PublishResult<OutgoingMessage> {
        let payload = serde_json::to_string(&StatePayload::from(reading))
            .map_err(|e| PublishError::Serialize(e.to_string()))?;
        Ok(OutgoingMessage {
            topic: self.state_topic(identifier),
            payload,
            retain: false,
        })
    }

    /// Retained status message.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Serialize`] if the payload cannot be encoded.
    pub fn status_message(&self, identifier: &str, status: &DeviceStatus) -> PublishResult<OutgoingMessage> {
        let payload =
            serde_json::to_string(status).map_err(|e| PublishError::Serialize(e.to_string()))?;
        Ok(OutgoingMessage {
            topic: self.status_topic(identifier),
            payload,
            retain: true,
        })
    }

    /// Retained discovery descriptors, one per entity.
    #[must_use]
    pub fn discovery_messages(&self, identifier: &str, metadata: &DeviceMetadata) -> Vec<OutgoingMessage> {
        let node = node_id(identifier);
        let device = json!({
            "identifiers": [format!("ensto_{node}")],
            "name": metadata.name,
            "manufacturer": metadata.manufacturer,
            "model": metadata.model,
        });
        let state_topic = self.state_topic(identifier);
        let availability_topic = self.availability_topic();

        ENTITIES
            .iter()
            .map(|entity| {
                let mut payload = json!({
                    "name": entity.name,
                    "unique_id": format!("ensto_{node}_{}", entity.metric),
                    "state_topic": state_topic,
                    "availability_topic": availability_topic,
                    "device": device,
                });
                if let Value::Object(map) = &mut payload {
                    if entity.component == "binary_sensor" {
                        map.insert(
                            "value_template".into(),
                            Value::String(format!(
                                "{{{{ 'ON' if value_json.{} else 'OFF' }}}}",
                                entity.field
                            )),
                        );
                        map.insert("device_class".into(), Value::String("power".into()));
                    } else {
                        map.insert(
                            "value_template".into(),
                            Value::String(format!("{{{{ value_json.{} }}}}", entity.field)),
                        );
                        map.insert("unit_of_measurement".into(), Value::String("°C".into()));
                        map.insert("device_class".into(), Value::String("temperature".into()));
                        map.insert("state_class".into(), Value::String("measurement".into()));
                    }
                }
                OutgoingMessage {
                    topic: format!(
                        "{}/{}/ensto_{node}/{}/config",
                        self.discovery_prefix, entity.component, entity.metric
                    ),
                    payload: payload.to_string(),
                    retain: true,
                }
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn reading() -> Reading {
        Reading {
            target_temperature: 21.5,
            room_temperature: 20.3,
            floor_temperature: 22.1,
            relay_active: true,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 15, 3, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_node_id_strips_separators() {
        assert_eq!(node_id("AA:BB:CC:DD:EE:FF"), "AABBCCDDEEFF");
        assert_eq!(node_id("Ensto-ECO16"), "EnstoECO16");
    }

    #[test]
    fn test_state_message() {
        let layout = TopicLayout::default();
        let msg = layout.state_message("AA:BB:CC:DD:EE:FF", &reading()).unwrap();
        assert_eq!(msg.topic, "ensto_bridge/AA:BB:CC:DD:EE:FF/state");
        assert_eq!(
            msg.payload,
            r#"{"target_temperature":21.5,"room_temperature":20.3,"floor_temperature":22.1,"relay_active":true}"#
        );
        assert!(!msg.retain);
    }

    #[test]
    fn test_state_message_is_repeatable() {
        let layout = TopicLayout::default();
        let r = reading();
        let first = layout.state_message("dev", &r).unwrap();
        let second = layout.state_message("dev", &r).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_discovery_messages() {
        let layout = TopicLayout::default();
        let meta = DeviceMetadata::ensto("AA:BB:CC:DD:EE:FF", Some("Bathroom"));
        let messages = layout.discovery_messages("AA:BB:CC:DD:EE:FF", &meta);

        let topics: Vec<&str> = messages.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/sensor/ensto_AABBCCDDEEFF/room_temp/config",
                "homeassistant/sensor/ensto_AABBCCDDEEFF/floor_temp/config",
                "homeassistant/sensor/ensto_AABBCCDDEEFF/target_temp/config",
                "homeassistant/binary_sensor/ensto_AABBCCDDEEFF/relay/config",
            ]
        );
        assert!(messages.iter().all(|m| m.retain));

        let relay: Value = serde_json::from_str(&messages[3].payload).unwrap();
        assert_eq!(relay["unique_id"], "ensto_AABBCCDDEEFF_relay");
        assert_eq!(relay["device_class"], "power");
        assert_eq!(
            relay["value_template"],
            "{{ 'ON' if value_json.relay_active else 'OFF' }}"
        );
        assert_eq!(relay["state_topic"], "ensto_bridge/AA:BB:CC:DD:EE:FF/state");

        let room: Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(room["unit_of_measurement"], "°C");
        assert_eq!(room["value_template"], "{{ value_json.room_temperature }}");
        assert_eq!(room["device"]["name"], "Bathroom");
        assert_eq!(room["device"]["identifiers"][0], "ensto_AABBCCDDEEFF");
    }

    #[test]
    fn test_custom_prefixes() {
        let layout = TopicLayout::new("thermostats/", "ha/");
        assert_eq!(layout.state_topic("x"), "thermostats/x/state");
        assert_eq!(layout.availability_topic(), "thermostats/status");
        let meta = DeviceMetadata::ensto("x", None);
        assert!(layout.discovery_messages("x", &meta)[0]
            .topic
            .starts_with("ha/sensor/"));
    }
}
