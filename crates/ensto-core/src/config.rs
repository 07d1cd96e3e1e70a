//! Bridge configuration.
//!
//! Handles loading and validating the bridge configuration:
//! - Thermostats to poll and whether each may capture a new secret
//! - MQTT broker connection and topic prefixes
//! - Session timing (timeouts, retry and reconnect backoff)
//! - Handshake protocol and target temperature calibration
//!
//! The file is TOML. Any key can be overridden from the environment with the
//! `ENSTO__` prefix and `__` as the nesting separator, for example
//! `ENSTO__MQTT__BROKER=broker.lan`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::Backoff;
use crate::decoder::TargetCalibration;
use crate::handshake::HandshakeConfig;
use crate::publisher::{DEFAULT_BASE_TOPIC, DEFAULT_DISCOVERY_PREFIX};
use crate::session::SessionTimings;

static MAC_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$").expect("MAC address pattern is valid")
});

/// Whether `address` looks like a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`).
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS.is_match(address)
}

/// Canonical `AA:BB:CC:DD:EE:FF` form of a MAC address, `None` for anything else.
#[must_use]
pub fn canonical_mac_address(address: &str) -> Option<String> {
    is_valid_mac_address(address).then(|| address.replace('-', ":").to_ascii_uppercase())
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// A single field is invalid.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("Configuration has {} errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        Self::ParseError(err.to_string())
    }
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Seconds between real-time reads of a connected thermostat.
    pub poll_interval_secs: u64,

    /// Secret store file.
    pub storage_path: PathBuf,

    /// MQTT broker settings.
    pub mqtt: MqttConfig,

    /// Session timing.
    pub session: SessionConfig,

    /// Handshake protocol settings.
    pub handshake: HandshakeConfig,

    /// Target temperature calibration.
    pub calibration: TargetCalibration,

    /// Thermostats to poll.
    pub devices: Vec<DeviceEntry>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 120,
            storage_path: crate::storage::default_storage_path(),
            mqtt: MqttConfig::default(),
            session: SessionConfig::default(),
            handshake: HandshakeConfig::default(),
            calibration: TargetCalibration::default(),
            devices: Vec::new(),
        }
    }
}

/// MQTT broker connection.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host.
    pub broker: String,

    /// Broker port.
    pub port: u16,

    /// Optional username.
    pub username: Option<String>,

    /// Optional password.
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Client id. Generated when absent.
    pub client_id: Option<String>,

    /// Root of the bridge's own topics.
    pub base_topic: String,

    /// Home Assistant discovery prefix.
    pub discovery_prefix: String,

    /// MQTT keep-alive in seconds.
    pub keep_alive_secs: u64,
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("base_topic", &self.base_topic)
            .field("discovery_prefix", &self.discovery_prefix)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .finish()
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            discovery_prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
            keep_alive_secs: 60,
        }
    }
}

/// Session timing knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on locating and connecting to a device.
    pub connect_timeout_secs: u64,
    /// Bound on a name-based scan.
    pub scan_timeout_secs: u64,
    /// Bound on each handshake step and each poll read.
    pub step_timeout_ms: u64,
    /// Service discovery attempts on one link.
    pub discovery_attempts: u32,
    /// First delay between discovery attempts.
    pub discovery_retry_base_ms: u64,
    /// Largest delay between discovery attempts.
    pub discovery_retry_max_ms: u64,
    /// First reconnect delay.
    pub reconnect_base_secs: u64,
    /// Largest reconnect delay.
    pub reconnect_max_secs: u64,
    /// Consecutive failed polls that drop the link.
    pub poll_failure_threshold: u32,
    /// Consecutive failed cycles that flag the device for attention.
    pub attention_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 20,
            scan_timeout_secs: 10,
            step_timeout_ms: 10_000,
            discovery_attempts: 4,
            discovery_retry_base_ms: 500,
            discovery_retry_max_ms: 5_000,
            reconnect_base_secs: 5,
            reconnect_max_secs: 300,
            poll_failure_threshold: 3,
            attention_threshold: 5,
        }
    }
}

/// A device in the `devices` list: a bare address or a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceEntry {
    /// Address or advertised name only.
    Address(String),
    /// Full device table.
    Detailed(DeviceConfig),
}

/// One thermostat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// MAC address or advertised name.
    pub address: String,

    /// Display name for Home Assistant.
    #[serde(default)]
    pub name: Option<String>,

    /// Whether a missing secret may be captured from pairing mode.
    #[serde(default = "default_allow_capture")]
    pub allow_capture: bool,
}

const fn default_allow_capture() -> bool {
    true
}

impl DeviceConfig {
    /// Device with defaults for everything but the address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            allow_capture: true,
        }
    }
}

impl From<DeviceEntry> for DeviceConfig {
    fn from(entry: DeviceEntry) -> Self {
        match entry {
            DeviceEntry::Address(address) => Self::new(address),
            DeviceEntry::Detailed(config) => config,
        }
    }
}

impl BridgeConfig {
    /// Load from a TOML file with `ENSTO__` environment overrides, then validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file is missing,
    /// [`ConfigError::ParseError`] if it cannot be parsed, or a validation
    /// error if values are out of range.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("ENSTO")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] or a validation error.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single error, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.poll_interval_secs == 0 {
            errors.push(ConfigError::invalid("poll_interval_secs", "must be at least 1"));
        }
        if self.mqtt.broker.trim().is_empty() {
            errors.push(ConfigError::invalid("mqtt.broker", "must not be empty"));
        }
        if self.mqtt.port == 0 {
            errors.push(ConfigError::invalid("mqtt.port", "must not be 0"));
        }
        if self.mqtt.base_topic.trim_matches('/').is_empty() {
            errors.push(ConfigError::invalid("mqtt.base_topic", "must not be empty"));
        }
        for (field, topic) in [
            ("mqtt.base_topic", &self.mqtt.base_topic),
            ("mqtt.discovery_prefix", &self.mqtt.discovery_prefix),
        ] {
            if topic.contains(['+', '#']) {
                errors.push(ConfigError::invalid(field, "must not contain MQTT wildcards"));
            }
        }

        let session = &self.session;
        for (field, value) in [
            ("session.connect_timeout_secs", session.connect_timeout_secs),
            ("session.step_timeout_ms", session.step_timeout_ms),
            ("session.discovery_retry_base_ms", session.discovery_retry_base_ms),
            ("session.reconnect_base_secs", session.reconnect_base_secs),
        ] {
            if value == 0 {
                errors.push(ConfigError::invalid(field, "must be greater than 0"));
            }
        }
        if session.discovery_retry_max_ms < session.discovery_retry_base_ms {
            errors.push(ConfigError::invalid(
                "session.discovery_retry_max_ms",
                "must not be below discovery_retry_base_ms",
            ));
        }
        if session.reconnect_max_secs < session.reconnect_base_secs {
            errors.push(ConfigError::invalid(
                "session.reconnect_max_secs",
                "must not be below reconnect_base_secs",
            ));
        }
        for (field, value) in [
            ("session.discovery_attempts", session.discovery_attempts),
            ("session.poll_failure_threshold", session.poll_failure_threshold),
            ("session.attention_threshold", session.attention_threshold),
        ] {
            if value == 0 {
                errors.push(ConfigError::invalid(field, "must be at least 1"));
            }
        }

        if self.handshake.secret_len == 0 {
            errors.push(ConfigError::invalid("handshake.secret_len", "must be at least 1"));
        }
        if let Err(message) = self.calibration.validate() {
            errors.push(ConfigError::invalid("calibration", message));
        }

        if self.devices.is_empty() {
            errors.push(ConfigError::invalid("devices", "at least one device is required"));
        }
        let mut seen = std::collections::HashSet::new();
        for (index, device) in self.device_configs().iter().enumerate() {
            let field = format!("devices[{index}].address");
            let address = device.address.trim();
            if address.is_empty() {
                errors.push(ConfigError::invalid(field, "must not be empty"));
                continue;
            }
            let looks_like_mac = address.len() == 17 && address.matches([':', '-']).count() == 5;
            if looks_like_mac && !is_valid_mac_address(address) {
                errors.push(ConfigError::invalid(
                    field,
                    format!("'{address}' is not a valid MAC address"),
                ));
            } else if !seen.insert(address.to_ascii_uppercase()) {
                errors.push(ConfigError::invalid(field, format!("duplicate device '{address}'")));
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Normalized device list.
    #[must_use]
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        self.devices.iter().cloned().map(DeviceConfig::from).collect()
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Session timings derived from this configuration.
    #[must_use]
    pub const fn timings(&self) -> SessionTimings {
        let s = &self.session;
        SessionTimings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            connect_timeout: Duration::from_secs(s.connect_timeout_secs),
            step_timeout: Duration::from_millis(s.step_timeout_ms),
            discovery_attempts: s.discovery_attempts,
            discovery_backoff: Backoff::new(
                Duration::from_millis(s.discovery_retry_base_ms),
                Duration::from_millis(s.discovery_retry_max_ms),
            ),
            reconnect_backoff: Backoff::new(
                Duration::from_secs(s.reconnect_base_secs),
                Duration::from_secs(s.reconnect_max_secs),
            ),
            poll_failure_threshold: s.poll_failure_threshold,
            attention_threshold: s.attention_threshold,
        }
    }

    /// Default configuration file location.
    ///
    /// `/etc/ensto-bridge/config.toml` on Linux, the platform config directory
    /// elsewhere.
    #[must_use]
    pub fn default_path() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/ensto-bridge/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "ensto-bridge").map_or_else(
                || PathBuf::from("config.toml"),
                |dirs| dirs.config_dir().join("config.toml"),
            )
        }
    }
}
