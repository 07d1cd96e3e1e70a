//! BlueZ transport via `bluer`.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, ErrorKind, Session};
use futures::{pin_mut, Stream, StreamExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BleLink, BleTransport, BluetoothError, BluetoothResult};
use crate::config::{canonical_mac_address, is_valid_mac_address};

// BlueZ often learns a device's name after `DeviceAdded`.
const NAME_RECHECK: Duration = Duration::from_secs(1);

fn map_bluer_error(err: bluer::Error) -> BluetoothError {
    match err.kind {
        ErrorKind::NotAuthorized
        | ErrorKind::NotPermitted
        | ErrorKind::AuthenticationFailed
        | ErrorKind::AuthenticationRejected => BluetoothError::NotAuthorized {
            message: err.message,
        },
        ErrorKind::NotReady => BluetoothError::AdapterPoweredOff,
        _ => BluetoothError::Internal {
            message: err.to_string(),
        },
    }
}

/// Transport over the system BlueZ daemon.
pub struct BluerTransport {
    // The session owns the D-Bus connection the adapter handle relies on.
    _session: Session,
    adapter: Adapter,
    scan_timeout: Duration,
}

impl BluerTransport {
    /// Open a BlueZ session on the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`BluetoothError::AdapterNotFound`] when there is no adapter and
    /// [`BluetoothError::AdapterPoweredOff`] when it is switched off.
    pub async fn new(scan_timeout: Duration) -> BluetoothResult<Self> {
        let session = Session::new().await.map_err(map_bluer_error)?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| BluetoothError::AdapterNotFound)?;

        if !adapter.is_powered().await.map_err(map_bluer_error)? {
            return Err(BluetoothError::AdapterPoweredOff);
        }

        info!(adapter = adapter.name(), "Bluetooth adapter ready");

        Ok(Self {
            _session: session,
            adapter,
            scan_timeout,
        })
    }

    async fn matches(device: &Device, identifier: &str) -> bool {
        match canonical_mac_address(identifier) {
            Some(address) => device.address().to_string() == address,
            None => matches!(device.name().await, Ok(Some(name)) if name == identifier),
        }
    }

    /// Look the device up among those BlueZ already knows, then scan.
    async fn resolve(&self, identifier: &str) -> BluetoothResult<Device> {
        let by_name = !is_valid_mac_address(identifier);
        let mut unnamed = Vec::new();

        let known = self
            .adapter
            .device_addresses()
            .await
            .map_err(map_bluer_error)?;
        for address in known {
            let device = self.adapter.device(address).map_err(map_bluer_error)?;
            if Self::matches(&device, identifier).await {
                return Ok(device);
            }
            if by_name {
                unnamed.push(device);
            }
        }

        debug!(identifier, "Scanning for device");
        let events = self
            .adapter
            .discover_devices()
            .await
            .map_err(map_bluer_error)?;
        let added = events.filter_map(|event| {
            std::future::ready(match event {
                AdapterEvent::DeviceAdded(address) => self.adapter.device(address).ok(),
                _ => None,
            })
        });
        let recheck = by_name.then_some(NAME_RECHECK);
        let scan = first_match(unnamed, added, recheck, |device: &Device| {
            let device = device.clone();
            async move { Self::matches(&device, identifier).await }
        });

        match tokio::time::timeout(self.scan_timeout, scan).await {
            Ok(Some(device)) => Ok(device),
            Ok(None) | Err(_) => Err(BluetoothError::DeviceNotFound {
                identifier: identifier.to_string(),
            }),
        }
    }
}

/// First candidate from `added` accepted by `is_match`.
///
/// With `recheck` set, candidates that did not match, including the already
/// checked `unmatched`, are tried again on every tick. Returns `None` when
/// `added` ends.
async fn first_match<T, S, F, Fut>(
    mut unmatched: Vec<T>,
    added: S,
    recheck: Option<Duration>,
    is_match: F,
) -> Option<T>
where
    T: Clone,
    S: Stream<Item = T>,
    F: Fn(&T) -> Fut,
    Fut: Future<Output = bool>,
{
    pin_mut!(added);
    let mut ticker = recheck.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            candidate = added.next() => {
                let candidate = candidate?;
                if is_match(&candidate).await {
                    return Some(candidate);
                }
                if recheck.is_some() {
                    unmatched.push(candidate);
                }
            }
            () = tick => {
                for candidate in &unmatched {
                    if is_match(candidate).await {
                        return Some(candidate.clone());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BleTransport for BluerTransport {
    async fn connect(&self, identifier: &str) -> BluetoothResult<Box<dyn BleLink>> {
        if identifier.contains(':') && !is_valid_mac_address(identifier) {
            return Err(BluetoothError::InvalidAddress {
                address: identifier.to_string(),
            });
        }

        let device = self.resolve(identifier).await?;
        let address: Address = device.address();

        if !device.is_connected().await.map_err(map_bluer_error)? {
            device
                .connect()
                .await
                .map_err(|e| BluetoothError::ConnectFailed {
                    identifier: identifier.to_string(),
                    message: e.to_string(),
                })?;
        }

        info!(identifier, %address, "Connected");

        Ok(Box::new(BluerLink {
            identifier: identifier.to_string(),
            address: address.to_string(),
            device,
            characteristics: HashMap::new(),
        }))
    }
}

/// GATT client link to one BlueZ device.
struct BluerLink {
    identifier: String,
    address: String,
    device: Device,
    characteristics: HashMap<Uuid, Characteristic>,
}

impl BluerLink {
    fn characteristic(&self, uuid: Uuid) -> BluetoothResult<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or(BluetoothError::CharacteristicNotFound { uuid })
    }

    async fn ensure_connected(&self) -> BluetoothResult<()> {
        if self.device.is_connected().await.map_err(map_bluer_error)? {
            Ok(())
        } else {
            Err(BluetoothError::Disconnected)
        }
    }
}

#[async_trait]
impl BleLink for BluerLink {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn discover_services(&mut self) -> BluetoothResult<()> {
        self.ensure_connected().await?;

        if !self
            .device
            .is_services_resolved()
            .await
            .map_err(map_bluer_error)?
        {
            return Err(BluetoothError::ServicesNotResolved {
                identifier: self.identifier.clone(),
            });
        }

        self.characteristics.clear();
        for service in self.device.services().await.map_err(map_bluer_error)? {
            for characteristic in service.characteristics().await.map_err(map_bluer_error)? {
                let uuid = characteristic.uuid().await.map_err(map_bluer_error)?;
                self.characteristics.insert(uuid, characteristic);
            }
        }

        debug!(
            identifier = %self.identifier,
            count = self.characteristics.len(),
            "Services resolved"
        );
        Ok(())
    }

    async fn read_characteristic(&mut self, uuid: Uuid) -> BluetoothResult<Vec<u8>> {
        let characteristic = self.characteristic(uuid)?;
        characteristic.read().await.map_err(map_bluer_error)
    }

    async fn write_characteristic(&mut self, uuid: Uuid, value: &[u8]) -> BluetoothResult<()> {
        let characteristic = self.characteristic(uuid)?;
        characteristic.write(value).await.map_err(map_bluer_error)
    }

    async fn disconnect(&mut self) -> BluetoothResult<()> {
        self.characteristics.clear();
        self.device.disconnect().await.map_err(map_bluer_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn test_name_learned_after_discovery_is_matched() {
        let names: Arc<Mutex<HashMap<u8, String>>> = Arc::default();
        let (tx, added) = futures::channel::mpsc::unbounded();
        tx.unbounded_send(1).unwrap();
        tx.unbounded_send(2).unwrap();

        let late = Arc::clone(&names);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            late.lock().unwrap().insert(2, "ECO16BT 535550".to_string());
        });

        let lookup = Arc::clone(&names);
        let found = first_match(Vec::new(), added, Some(NAME_RECHECK), move |id: &u8| {
            let hit = lookup.lock().unwrap().get(id).map(String::as_str) == Some("ECO16BT 535550");
            std::future::ready(hit)
        });
        let found = tokio::time::timeout(Duration::from_secs(10), found).await.unwrap();

        assert_eq!(found, Some(2));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_known_candidates_are_rechecked() {
        let named = Arc::new(Mutex::new(false));
        let (tx, added) = futures::channel::mpsc::unbounded::<u8>();

        let later = Arc::clone(&named);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            *later.lock().unwrap() = true;
        });

        let lookup = Arc::clone(&named);
        let found = first_match(vec![7], added, Some(NAME_RECHECK), move |id: &u8| {
            std::future::ready(*id == 7 && *lookup.lock().unwrap())
        });
        let found = tokio::time::timeout(Duration::from_secs(10), found).await.unwrap();

        assert_eq!(found, Some(7));
        drop(tx);
    }

    #[tokio::test]
    async fn test_address_lookup_ends_with_the_stream() {
        let added = futures::stream::iter([1u8, 2, 3]);
        let found = first_match(Vec::new(), added, None, |id: &u8| std::future::ready(*id == 9)).await;
        assert_eq!(found, None);

        let added = futures::stream::iter([1u8, 2, 3]);
        let found = first_match(Vec::new(), added, None, |id: &u8| std::future::ready(*id == 2)).await;
        assert_eq!(found, Some(2));
    }
}
