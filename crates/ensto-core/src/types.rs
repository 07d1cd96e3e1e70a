//! Shared types.
//!
//! This module contains value types passed between the session, the decoder,
//! the secret store and the publisher.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The device-issued secret captured once in pairing mode ("Factory Reset ID").
///
/// The bytes are opaque. `Debug` never prints them; use [`FactoryResetId::to_hex`]
/// when the value really has to be shown.
#[derive(Clone, PartialEq, Eq)]
pub struct FactoryResetId(Vec<u8>);

impl FactoryResetId {
    /// Wrap raw secret bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded secret as stored on disk.
    ///
    /// # Errors
    ///
    /// Returns the hex decoding error for malformed input.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(hex_str.trim()).map(Self)
    }

    /// Hex encoding used by the secret file.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Raw secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of bytes in the secret.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the secret holds no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A device that is not in pairing mode answers the capture read with zeros.
    #[must_use]
    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for FactoryResetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FactoryResetId(<{} bytes>)", self.0.len())
    }
}

/// One decoded sample of the thermostat's real-time indication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Target temperature in °C after calibration, one decimal.
    pub target_temperature: f64,

    /// Room temperature in °C, one decimal.
    pub room_temperature: f64,

    /// Floor sensor temperature in °C, one decimal.
    pub floor_temperature: f64,

    /// Whether the heating relay is closed.
    pub relay_active: bool,

    /// When the characteristic was read.
    pub timestamp: DateTime<Utc>,
}

/// Static description of a device, used for Home Assistant discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Configured identifier (MAC address or advertised name).
    pub identifier: String,

    /// Human readable name shown in Home Assistant.
    pub name: String,

    /// Manufacturer string.
    pub manufacturer: String,

    /// Model string.
    pub model: String,
}

impl DeviceMetadata {
    /// Metadata for an Ensto thermostat, falling back to a generated name.
    #[must_use]
    pub fn ensto(identifier: &str, name: Option<&str>) -> Self {
        let name = name.map_or_else(
            || format!("Ensto Thermostat {}", crate::publisher::node_id(identifier)),
            str::to_string,
        );
        Self {
            identifier: identifier.to_string(),
            name,
            manufacturer: "Ensto".to_string(),
            model: "BLE Thermostat".to_string(),
        }
    }
}

/// Per-device session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not started yet.
    Idle,
    /// Connecting the link and waiting for service discovery.
    Connecting,
    /// Running the capture or resume handshake.
    Handshaking,
    /// Authenticated and reading on every tick.
    Polling,
    /// Link torn down, reconnect pending.
    Disconnected,
    /// Needs operator action; the device is no longer polled.
    Fatal,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Polling => "polling",
            Self::Disconnected => "disconnected",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Snapshot of a session for operator reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Configured identifier.
    pub identifier: String,

    /// MAC address the identifier resolved to, once connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Current state.
    pub state: SessionState,

    /// Consecutive failed connection cycles or polls.
    pub consecutive_failures: u32,

    /// Set when the device needs operator action (re-pairing, range, config).
    pub needs_attention: bool,

    /// Why the device was flagged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attention_reason: Option<String>,

    /// Timestamp of the last published reading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reading_at: Option<DateTime<Utc>>,

    /// Error code of the last failed connection cycle, e.g. `AUTH_REJECTED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
