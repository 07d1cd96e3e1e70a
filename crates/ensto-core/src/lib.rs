//! # ensto-core
//!
//! Core logic for bridging Ensto BLE thermostats to MQTT.
//!
//! This crate provides:
//! - Authenticated BLE sessions: Factory Reset ID capture on first pairing,
//!   resume with the stored secret afterwards
//! - Per-device reconnection with capped exponential backoff
//! - Real-time reading decoding with configurable target calibration
//! - The publisher contract and Home Assistant payload construction
//! - Durable secret storage with atomic writes
//!
//! ## Architecture
//!
//! - [`bluetooth`] - BLE transport contract, BlueZ adapter and scripted mock
//! - [`handshake`] - Capture and resume exchanges over a connected link
//! - [`session`] - Per-device state machine
//! - [`bridge`] - One session task per device, shared status board
//! - [`decoder`] - Real-time payload decoding and calibration curves
//! - [`publisher`] - Publisher trait, topics and payloads
//! - [`storage`] - Secret store and its backends
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Unified error type
//! - [`types`] - Shared domain types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod backoff;
pub mod bluetooth;
pub mod bridge;
pub mod config;
pub mod decoder;
pub mod error;
pub mod handshake;
pub mod publisher;
pub mod session;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use backoff::Backoff;
#[cfg(feature = "bluetooth")]
pub use bluetooth::bluez::BluerTransport;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use bluetooth::mock::{MockDevice, MockTransport};
pub use bluetooth::{
    BleLink, BleTransport, BluetoothError, BluetoothResult, FACTORY_RESET_ID_UUID,
    REAL_TIME_INDICATION_UUID,
};
pub use bridge::Bridge;
pub use config::{
    canonical_mac_address, is_valid_mac_address, BridgeConfig, ConfigError, ConfigResult, DeviceConfig, DeviceEntry,
    MqttConfig, SessionConfig,
};
pub use decoder::{decode_realtime, encode_realtime, CalibrationCurve, DecodeError, TargetCalibration};
pub use error::{BridgeError, Result};
pub use handshake::{HandshakeConfig, HandshakeEngine, HandshakeError, HandshakeMode, HandshakeOutcome};
pub use publisher::{OutgoingMessage, PublishError, PublishResult, Publisher, TopicLayout};
pub use session::{DeviceSession, SessionContext, SessionError, SessionTimings, StatusBoard};
pub use storage::{default_storage_path, JsonFileBackend, MemoryBackend, SecretBackend, SecretStore, StorageError};
pub use types::{DeviceMetadata, DeviceStatus, FactoryResetId, Reading, SessionState};
