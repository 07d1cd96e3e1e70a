//! Unified error type for the bridge.
//!
//! Each module has its own error type ([`BluetoothError`], [`HandshakeError`],
//! [`DecodeError`], [`StorageError`], [`ConfigError`], [`SessionError`]).
//! [`BridgeError`] folds them into one enum and classifies them by recovery
//! policy:
//!
//! | Class | Policy |
//! |-------|--------|
//! | transient link | retry with backoff |
//! | authentication | retry with backoff, flag for attention, keep the secret |
//! | decode | drop the reading |
//! | persistence | warn, keep the in-memory secret, retry later |
//! | adapter unavailable | retry with backoff, flag for attention |
//! | fatal config | device unpollable; at startup the process exits |
//!
//! [`BluetoothError`]: crate::bluetooth::BluetoothError
//! [`HandshakeError`]: crate::handshake::HandshakeError
//! [`DecodeError`]: crate::decoder::DecodeError
//! [`StorageError`]: crate::storage::StorageError
//! [`ConfigError`]: crate::config::ConfigError
//! [`SessionError`]: crate::session::SessionError

use std::path::PathBuf;
use thiserror::Error;

use crate::bluetooth::BluetoothError;
use crate::config::ConfigError;
use crate::decoder::DecodeError;
use crate::handshake::HandshakeError;
use crate::session::SessionError;
use crate::storage::StorageError;

/// The unified error type for bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No usable Bluetooth adapter.
    #[error("Bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    /// A link-level failure that a later attempt may not see.
    #[error("Transient link error: {0}")]
    TransientLink(String),

    // =========================================================================
    // AUTHENTICATION ERRORS
    // =========================================================================
    /// The device refused the stored secret.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// No well-formed secret could be captured.
    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    // =========================================================================
    // DATA ERRORS
    // =========================================================================
    /// A real-time payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    // =========================================================================
    // PERSISTENCE ERRORS
    // =========================================================================
    /// The secret store file is unreadable or corrupt.
    #[error("Secret store at {} is corrupt: {message}", path.display())]
    SecretStoreCorrupt {
        /// Store path.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// A secret could not be written durably.
    #[error("Persistence error: {0}")]
    Persistence(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// The configuration contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// A device cannot be polled with the current configuration.
    #[error("Device unpollable: {0}")]
    Unpollable(String),
}

/// A specialized [`Result`] type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Whether retrying later may succeed without operator action.
    #[inline]
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientLink(_) | Self::Persistence(_))
    }

    /// Whether the device refused or could not issue a secret.
    #[inline]
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self, Self::AuthRejected(_) | Self::CaptureFailed(_))
    }

    /// Whether retrying cannot help: the device is unpollable, or at startup
    /// the process exits.
    ///
    /// A missing or powered-off adapter is not fatal for a running device; it
    /// is retried and flagged instead.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SecretStoreCorrupt { .. }
                | Self::ConfigNotFound(_)
                | Self::ConfigParse(_)
                | Self::ConfigValidation(_)
                | Self::Unpollable(_)
        )
    }

    /// Machine-readable error code for logs and status payloads.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothUnavailable(_) => "BLUETOOTH_UNAVAILABLE",
            Self::TransientLink(_) => "TRANSIENT_LINK_ERROR",
            Self::AuthRejected(_) => "AUTH_REJECTED",
            Self::CaptureFailed(_) => "CAPTURE_FAILED",
            Self::Decode(_) => "DECODE_ERROR",
            Self::SecretStoreCorrupt { .. } => "SECRET_STORE_CORRUPT",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParse(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidation(_) => "CONFIG_VALIDATION_ERROR",
            Self::Unpollable(_) => "DEVICE_UNPOLLABLE",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<BluetoothError> for BridgeError {
    fn from(err: BluetoothError) -> Self {
        match err {
            unavailable @ (BluetoothError::AdapterNotFound | BluetoothError::AdapterPoweredOff) => {
                Self::BluetoothUnavailable(unavailable.to_string())
            }
            BluetoothError::InvalidAddress { address } => {
                Self::ConfigValidation(format!("Invalid Bluetooth address: {address}"))
            }
            BluetoothError::NotAuthorized { message } => Self::AuthRejected(message),
            other => Self::TransientLink(other.to_string()),
        }
    }
}

impl From<HandshakeError> for BridgeError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::HandshakeRejected { reason } => Self::AuthRejected(reason),
            HandshakeError::CaptureFailed { reason } => Self::CaptureFailed(reason),
            HandshakeError::Link(link) => link.into(),
            other => Self::TransientLink(other.to_string()),
        }
    }
}

impl From<StorageError> for BridgeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ReadError { path, source } => Self::SecretStoreCorrupt {
                path,
                message: source.to_string(),
            },
            StorageError::Corrupt { path, message } => Self::SecretStoreCorrupt { path, message },
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path.into()),
            ConfigError::ParseError(message) => Self::ConfigParse(message),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidation(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidation(messages.join("; "))
            }
        }
    }
}

impl From<SessionError> for BridgeError {
    fn from(err: SessionError) -> Self {
        Self::Unpollable(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_errors_are_transient() {
        let err: BridgeError = BluetoothError::ServicesNotResolved {
            identifier: "AA:BB:CC:DD:EE:FF".into(),
        }
        .into();
        assert!(err.is_transient());
        assert!(!err.is_auth_error());
        assert_eq!(err.error_code(), "TRANSIENT_LINK_ERROR");

        let err: BridgeError = HandshakeError::HandshakeTimeout {
            step: "capture read",
            millis: 5000,
        }
        .into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_auth_classification() {
        let err: BridgeError = HandshakeError::HandshakeRejected {
            reason: "not authorized".into(),
        }
        .into();
        assert!(err.is_auth_error());
        assert!(!err.is_transient());
        assert_eq!(err.error_code(), "AUTH_REJECTED");

        let err: BridgeError = HandshakeError::CaptureFailed {
            reason: "all zeros".into(),
        }
        .into();
        assert_eq!(err.error_code(), "CAPTURE_FAILED");
    }

    #[test]
    fn test_wrapped_link_error_is_unwrapped() {
        let err: BridgeError = HandshakeError::Link(BluetoothError::AdapterPoweredOff).into();
        assert!(matches!(err, BridgeError::BluetoothUnavailable(_)));
        assert!(!err.is_fatal());
        assert!(!err.is_transient());

        let err: BridgeError = BluetoothError::InvalidAddress {
            address: "AA:BB".into(),
        }
        .into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_storage_conversion() {
        let err: BridgeError = StorageError::Corrupt {
            path: PathBuf::from("/var/lib/ensto-bridge/devices.json"),
            message: "bad hex".into(),
        }
        .into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("devices.json"));

        let err: BridgeError = StorageError::WriteError {
            path: PathBuf::from("/ro/devices.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        }
        .into();
        assert!(err.is_transient());
        assert_eq!(err.error_code(), "PERSISTENCE_ERROR");
    }

    #[test]
    fn test_config_conversion_joins_messages() {
        let err: BridgeError = ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "mqtt.port".into(),
                message: "must not be 0".into(),
            },
            ConfigError::ValidationError {
                field: "devices".into(),
                message: "at least one device is required".into(),
            },
        ])
        .into();
        let message = err.to_string();
        assert!(message.contains("mqtt.port"));
        assert!(message.contains("; "));
        assert_eq!(err.error_code(), "CONFIG_VALIDATION_ERROR");
    }

    #[test]
    fn test_missing_secret_is_fatal() {
        let err: BridgeError = SessionError::MissingSecret {
            identifier: "AA:BB:CC:DD:EE:FF".into(),
        }
        .into();
        assert!(err.is_fatal());
        assert_eq!(err.error_code(), "DEVICE_UNPOLLABLE");
    }

    #[test]
    fn test_decode_error_is_neither_transient_nor_fatal() {
        let err: BridgeError = DecodeError::TooShort {
            expected: 14,
            actual: 3,
        }
        .into();
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BridgeError>();
        assert_sync::<BridgeError>();
    }
}
