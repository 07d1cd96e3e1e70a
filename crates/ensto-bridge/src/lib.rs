//! # ensto-bridge
//!
//! Process-level pieces of the Ensto thermostat bridge: logging setup and the
//! MQTT publisher. The session logic lives in `ensto-core`.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod logging;
pub mod mqtt;

pub use mqtt::MqttPublisher;
