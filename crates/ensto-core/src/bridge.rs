//! Supervisor running one session task per configured thermostat.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::bluetooth::BleTransport;
use crate::config::{BridgeConfig, DeviceConfig};
use crate::handshake::HandshakeEngine;
use crate::publisher::Publisher;
use crate::session::{DeviceSession, SessionContext, StatusBoard};
use crate::storage::SecretStore;
use crate::types::{DeviceStatus, SessionState};

/// Owns the shared collaborators and the device list.
pub struct Bridge {
    ctx: SessionContext,
    devices: Vec<DeviceConfig>,
}

impl Bridge {
    /// Assemble a bridge from configuration and its collaborators.
    #[must_use]
    pub fn new(
        config: &BridgeConfig,
        transport: Arc<dyn BleTransport>,
        store: Arc<SecretStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let engine = HandshakeEngine::new(
            config.handshake.clone(),
            Duration::from_millis(config.session.step_timeout_ms),
        );
        let ctx = SessionContext {
            transport,
            store,
            publisher,
            engine,
            calibration: Arc::new(config.calibration.clone()),
            timings: config.timings(),
            board: Some(Arc::new(RwLock::new(HashMap::new()))),
        };
        Self {
            ctx,
            devices: config.device_configs(),
        }
    }

    /// Live per-device status.
    #[must_use]
    pub fn status_board(&self) -> StatusBoard {
        self.ctx.board.clone().unwrap_or_default()
    }

    /// Run every session until `shutdown` flips to true.
    ///
    /// A device that becomes unpollable ends its own task; the others keep
    /// running. Returns the final status of every device, sorted by identifier.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Vec<DeviceStatus> {
        info!(devices = self.devices.len(), "Starting device sessions");
        let mut tasks = JoinSet::new();
        for device in self.devices {
            let session = DeviceSession::new(device, self.ctx.clone());
            tasks.spawn(session.run(shutdown.clone()));
        }

        let mut statuses = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(status) if status.state == SessionState::Fatal => {
                    error!(
                        device = %status.identifier,
                        reason = status.attention_reason.as_deref().unwrap_or("unknown"),
                        "Device stopped; other devices keep running"
                    );
                    statuses.push(status);
                }
                Ok(status) => statuses.push(status),
                Err(err) => warn!(error = %err, "Session task aborted"),
            }
        }
        statuses.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        info!("All device sessions stopped");
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{MockDevice, MockTransport};
    use crate::bluetooth::REAL_TIME_INDICATION_UUID;
    use crate::config::DeviceEntry;
    use crate::decoder::{encode_realtime, TargetCalibration};
    use crate::publisher::recording::RecordingPublisher;
    use crate::storage::MemoryBackend;

    fn config() -> BridgeConfig {
        BridgeConfig {
            devices: vec![
                DeviceEntry::Address("AA:BB:CC:DD:EE:FF".into()),
                DeviceEntry::Detailed(DeviceConfig {
                    address: "11:22:33:44:55:66".into(),
                    name: Some("Hallway".into()),
                    allow_capture: false,
                }),
            ],
            ..BridgeConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpollable_device_does_not_stop_others() {
        let payload = encode_realtime(21.5, 20.3, 22.1, true, &TargetCalibration::default());
        let transport = MockTransport::new();
        transport.add_device(
            "AA:BB:CC:DD:EE:FF",
            MockDevice::new(&[1, 2, 3, 4])
                .in_pairing_mode()
                .with_value(REAL_TIME_INDICATION_UUID, payload.clone()),
        );
        transport.add_device(
            "11:22:33:44:55:66",
            MockDevice::new(&[5, 6, 7, 8]).with_value(REAL_TIME_INDICATION_UUID, payload),
        );
        let publisher = RecordingPublisher::new();
        let store = Arc::new(SecretStore::open(MemoryBackend::new()).unwrap());

        let bridge = Bridge::new(
            &config(),
            Arc::new(transport.clone()),
            store,
            Arc::new(publisher.clone()),
        );
        let board = bridge.status_board();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(bridge.run(rx));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(
            board.read().await["11:22:33:44:55:66"].state,
            SessionState::Fatal
        );
        tx.send(true).unwrap();
        let statuses = handle.await.unwrap();

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].identifier, "11:22:33:44:55:66");
        assert_eq!(statuses[0].state, SessionState::Fatal);
        assert_eq!(statuses[1].state, SessionState::Polling);

        // 0 s, 120 s and 240 s
        let states = publisher.with_suffix("AA:BB:CC:DD:EE:FF/state");
        assert_eq!(states.len(), 3);
        assert!(publisher
            .with_suffix("11:22:33:44:55:66/state")
            .is_empty());
        assert_eq!(transport.device("AA:BB:CC:DD:EE:FF").unwrap().disconnects, 1);
    }
}
