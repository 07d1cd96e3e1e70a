//! BLE transport contract.
//!
//! The session never talks to BlueZ directly. It asks a [`BleTransport`] for a
//! connected [`BleLink`] and drives the GATT exchange through it. A link is
//! exclusively owned by one session and is dropped after `disconnect`.
//!
//! - [`bluez`] - BlueZ implementation on top of `bluer` (Linux only)
//! - [`mock`] - scripted in-memory transport for tests and dry runs

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "bluetooth")]
pub mod bluez;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;

/// Ensto vendor characteristic holding the Factory Reset ID.
///
/// Reading it in pairing mode returns the secret; writing the secret back
/// authenticates the connection.
pub const FACTORY_RESET_ID_UUID: Uuid = Uuid::from_u128(0xf366_dddb_ebe2_43ee_83c0_472d_ed74_c8fa);

/// Ensto vendor characteristic with the live temperatures and relay state.
pub const REAL_TIME_INDICATION_UUID: Uuid =
    Uuid::from_u128(0x66ad_3e6b_3135_4ada_bb2b_8b22_916b_21d4);

/// Errors reported by the BLE transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BluetoothError {
    /// No adapter is present.
    #[error("No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded.")]
    AdapterNotFound,

    /// The adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    AdapterPoweredOff,

    /// The device did not show up during the scan.
    #[error("Device not found: '{identifier}'. Ensure the thermostat is powered and within range.")]
    DeviceNotFound {
        /// Address or name that was searched for.
        identifier: String,
    },

    /// The configured address is not a valid MAC address.
    #[error("Invalid Bluetooth address: {address}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
    },

    /// The connect call failed.
    #[error("Failed to connect to {identifier}: {message}")]
    ConnectFailed {
        /// Device identifier.
        identifier: String,
        /// Stack-provided reason.
        message: String,
    },

    /// Connected, but the stack has not finished resolving GATT services.
    #[error("Services of {identifier} are not resolved yet")]
    ServicesNotResolved {
        /// Device identifier.
        identifier: String,
    },

    /// A required characteristic is absent from the resolved services.
    #[error("Characteristic {uuid} not found")]
    CharacteristicNotFound {
        /// The missing characteristic.
        uuid: Uuid,
    },

    /// The device refused a read or write (GATT insufficient authorization).
    #[error("Operation not authorized by device: {message}")]
    NotAuthorized {
        /// Stack-provided reason.
        message: String,
    },

    /// A GATT operation did not complete in time.
    #[error("{operation} timed out after {millis} ms")]
    Timeout {
        /// Which operation timed out.
        operation: String,
        /// The bound that was exceeded.
        millis: u64,
    },

    /// The link dropped underneath us.
    #[error("Device disconnected")]
    Disconnected,

    /// Anything else reported by the stack.
    #[error("Bluetooth error: {message}")]
    Internal {
        /// Stack-provided reason.
        message: String,
    },
}

/// Result alias for transport operations.
pub type BluetoothResult<T> = std::result::Result<T, BluetoothError>;

impl BluetoothError {
    /// Returns `true` when retrying the same operation later can succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::InvalidAddress { .. } | Self::NotAuthorized { .. }
        )
    }

    /// Returns `true` for the "connected but GATT not ready" condition.
    #[must_use]
    pub const fn is_discovery_pending(&self) -> bool {
        matches!(
            self,
            Self::ServicesNotResolved { .. } | Self::CharacteristicNotFound { .. }
        )
    }
}

/// Factory for BLE links.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Locate the device by MAC address or advertised name and connect to it.
    async fn connect(&self, identifier: &str) -> BluetoothResult<Box<dyn BleLink>>;
}

/// A connected GATT client link to one device.
#[async_trait]
pub trait BleLink: Send {
    /// The identifier this link was opened for.
    fn identifier(&self) -> &str;

    /// MAC address of the connected device (`AA:BB:CC:DD:EE:FF`), whether it
    /// was located by address or by advertised name.
    fn address(&self) -> &str;

    /// Enumerate services and characteristics.
    ///
    /// Returns [`BluetoothError::ServicesNotResolved`] while the stack is still
    /// resolving; callers retry.
    async fn discover_services(&mut self) -> BluetoothResult<()>;

    /// Read the current value of a characteristic.
    async fn read_characteristic(&mut self, uuid: Uuid) -> BluetoothResult<Vec<u8>>;

    /// Write a value to a characteristic with response.
    async fn write_characteristic(&mut self, uuid: Uuid, value: &[u8]) -> BluetoothResult<()>;

    /// Tear the link down.
    async fn disconnect(&mut self) -> BluetoothResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_uuids() {
        assert_eq!(
            FACTORY_RESET_ID_UUID.to_string(),
            "f366dddb-ebe2-43ee-83c0-472ded74c8fa"
        );
        assert_eq!(
            REAL_TIME_INDICATION_UUID.to_string(),
            "66ad3e6b-3135-4ada-bb2b-8b22916b21d4"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(BluetoothError::Disconnected.is_transient());
        assert!(BluetoothError::ServicesNotResolved {
            identifier: "x".into()
        }
        .is_transient());
        assert!(!BluetoothError::NotAuthorized {
            message: "denied".into()
        }
        .is_transient());
        assert!(!BluetoothError::InvalidAddress {
            address: "nope".into()
        }
        .is_transient());
    }

    #[test]
    fn test_discovery_pending() {
        assert!(BluetoothError::ServicesNotResolved {
            identifier: "x".into()
        }
        .is_discovery_pending());
        assert!(BluetoothError::CharacteristicNotFound {
            uuid: FACTORY_RESET_ID_UUID
        }
        .is_discovery_pending());
        assert!(!BluetoothError::Disconnected.is_discovery_pending());
    }
}
