//! Scripted in-memory transport.
//!
//! Each [`MockDevice`] models one thermostat: whether it is in pairing mode,
//! which secret it accepts, how many discovery attempts report "not resolved",
//! and what the real-time characteristic returns. Every write and connection
//! is recorded so tests can assert on the exchange.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    BleLink, BleTransport, BluetoothError, BluetoothResult, FACTORY_RESET_ID_UUID,
};

/// Simulated thermostat.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    /// Secret the device issues in pairing mode and accepts for authentication.
    pub secret: Vec<u8>,
    /// Address reported by links. Defaults to the registration identifier.
    pub address: Option<String>,
    /// Whether a Factory Reset ID read returns the secret (otherwise zeros).
    pub pairing_mode: bool,
    /// Characteristic values returned by reads.
    pub values: HashMap<Uuid, Vec<u8>>,
    /// Errors returned by the next connect calls, in order.
    pub connect_errors: VecDeque<BluetoothError>,
    /// Number of upcoming discovery calls that report "not resolved".
    pub unresolved_discoveries: u32,
    /// Errors returned by the next reads of a characteristic, in order.
    pub read_errors: HashMap<Uuid, VecDeque<BluetoothError>>,
    /// Delay applied to every read.
    pub read_delay: Option<Duration>,
    /// Every write issued, in order.
    pub writes: Vec<(Uuid, Vec<u8>)>,
    /// Every read issued, in order.
    pub reads: Vec<Uuid>,
    /// Successful connects.
    pub connects: u32,
    /// Discovery calls, successful or not.
    pub discoveries: u32,
    /// Disconnect calls.
    pub disconnects: u32,
}

impl MockDevice {
    /// A device issuing and accepting `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
            ..Self::default()
        }
    }

    /// Report `address` as the device address, for devices registered by name.
    #[must_use]
    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    /// Put the device in pairing mode.
    #[must_use]
    pub const fn in_pairing_mode(mut self) -> Self {
        self.pairing_mode = true;
        self
    }

    /// Set the value returned when reading `uuid`.
    #[must_use]
    pub fn with_value(mut self, uuid: Uuid, value: Vec<u8>) -> Self {
        self.values.insert(uuid, value);
        self
    }

    /// Report "services not resolved" on the next `count` discovery calls.
    #[must_use]
    pub const fn with_unresolved_discoveries(mut self, count: u32) -> Self {
        self.unresolved_discoveries = count;
        self
    }

    /// Fail the next connect call with `err`.
    #[must_use]
    pub fn with_connect_error(mut self, err: BluetoothError) -> Self {
        self.connect_errors.push_back(err);
        self
    }

    /// Fail the next read of `uuid` with `err`.
    #[must_use]
    pub fn with_read_error(mut self, uuid: Uuid, err: BluetoothError) -> Self {
        self.read_errors.entry(uuid).or_default().push_back(err);
        self
    }

    /// Delay every read by `delay`.
    #[must_use]
    pub const fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Writes issued to `uuid`.
    #[must_use]
    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|(u, _)| *u == uuid)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

type SharedDevice = Arc<Mutex<MockDevice>>;

fn lock(device: &SharedDevice) -> MutexGuard<'_, MockDevice> {
    device.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Transport serving [`MockDevice`]s keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    devices: Arc<Mutex<HashMap<String, SharedDevice>>>,
}

impl MockTransport {
    /// An empty transport; every connect fails with `DeviceNotFound`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under `identifier`.
    pub fn add_device(&self, identifier: &str, device: MockDevice) {
        self.devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(identifier.to_string(), Arc::new(Mutex::new(device)));
    }

    /// Snapshot of a registered device, including its recorded traffic.
    #[must_use]
    pub fn device(&self, identifier: &str) -> Option<MockDevice> {
        self.shared(identifier).map(|d| lock(&d).clone())
    }

    /// Mutate a registered device in place.
    pub fn update_device(&self, identifier: &str, f: impl FnOnce(&mut MockDevice)) {
        if let Some(device) = self.shared(identifier) {
            f(&mut lock(&device));
        }
    }

    fn shared(&self, identifier: &str) -> Option<SharedDevice> {
        self.devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(identifier)
            .cloned()
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn connect(&self, identifier: &str) -> BluetoothResult<Box<dyn BleLink>> {
        let device = self
            .shared(identifier)
            .ok_or_else(|| BluetoothError::DeviceNotFound {
                identifier: identifier.to_string(),
            })?;

        let address = {
            let mut state = lock(&device);
            if let Some(err) = state.connect_errors.pop_front() {
                return Err(err);
            }
            state.connects += 1;
            state
                .address
                .clone()
                .unwrap_or_else(|| identifier.to_string())
        };

        Ok(Box::new(MockLink {
            identifier: identifier.to_string(),
            address,
            device,
            connected: true,
            resolved: false,
        }))
    }
}

struct MockLink {
    identifier: String,
    address: String,
    device: SharedDevice,
    connected: bool,
    resolved: bool,
}

impl MockLink {
    fn check(&self) -> BluetoothResult<()> {
        if !self.connected {
            return Err(BluetoothError::Disconnected);
        }
        if !self.resolved {
            return Err(BluetoothError::ServicesNotResolved {
                identifier: String::new(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BleLink for MockLink {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn discover_services(&mut self) -> BluetoothResult<()> {
        if !self.connected {
            return Err(BluetoothError::Disconnected);
        }
        let mut state = lock(&self.device);
        state.discoveries += 1;
        if state.unresolved_discoveries > 0 {
            state.unresolved_discoveries -= 1;
            return Err(BluetoothError::ServicesNotResolved {
                identifier: self.identifier.clone(),
            });
        }
        drop(state);
        self.resolved = true;
        Ok(())
    }

    async fn read_characteristic(&mut self, uuid: Uuid) -> BluetoothResult<Vec<u8>> {
        self.check()?;
        let delay = lock(&self.device).read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.device);
        state.reads.push(uuid);
        if let Some(err) = state.read_errors.get_mut(&uuid).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        if uuid == FACTORY_RESET_ID_UUID {
            return Ok(if state.pairing_mode {
                state.secret.clone()
            } else {
                vec![0; state.secret.len()]
            });
        }

        state
            .values
            .get(&uuid)
            .cloned()
            .ok_or(BluetoothError::CharacteristicNotFound { uuid })
    }

    async fn write_characteristic(&mut self, uuid: Uuid, value: &[u8]) -> BluetoothResult<()> {
        self.check()?;
        let mut state = lock(&self.device);
        state.writes.push((uuid, value.to_vec()));

        if uuid == FACTORY_RESET_ID_UUID && value != state.secret.as_slice() {
            return Err(BluetoothError::NotAuthorized {
                message: "Factory Reset ID mismatch".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> BluetoothResult<()> {
        self.connected = false;
        self.resolved = false;
        lock(&self.device).disconnects += 1;
        Ok(())
    }
}
