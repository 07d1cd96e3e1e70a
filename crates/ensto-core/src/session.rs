//! Per-device session state machine.
//!
//! ```text
//! Idle -> Connecting -> Handshaking -> Polling
//!   |         ^              |            |
//!   |         |              v            v
//!   |         +-------- Disconnected <----+
//!   |                        |
//!   +---------------------> Fatal
//! ```
//!
//! The machine is step-driven: [`DeviceSession::step`] performs one
//! transition and returns how long to wait before the next one.
//! [`DeviceSession::run`] loops it until shutdown or `Fatal`.
//!
//! Secrets, topics and discovery ids are keyed by the device's MAC address.
//! A device configured by advertised name gets its address from the first
//! link; until then the configured name stands in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::Backoff;
use crate::bluetooth::{BleLink, BleTransport, BluetoothError, REAL_TIME_INDICATION_UUID};
use crate::config::{canonical_mac_address, DeviceConfig};
use crate::decoder::{decode_realtime, CalibrationCurve};
use crate::error::BridgeError;
use crate::handshake::{HandshakeEngine, HandshakeMode, HandshakeOutcome};
use crate::publisher::Publisher;
use crate::storage::SecretStore;
use crate::types::{DeviceMetadata, DeviceStatus, Reading, SessionState};

/// Latest status of every device, keyed by configured identifier.
pub type StatusBoard = Arc<RwLock<HashMap<String, DeviceStatus>>>;

/// Errors that make a device unpollable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// No stored secret and capture is disabled for the device.
    #[error("No Factory Reset ID stored for {identifier} and capture is disabled")]
    MissingSecret {
        /// Device identifier.
        identifier: String,
    },
}

/// Timing parameters of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Delay between real-time reads.
    pub poll_interval: Duration,
    /// Bound on locating and connecting.
    pub connect_timeout: Duration,
    /// Bound on each discovery attempt, poll read and teardown.
    pub step_timeout: Duration,
    /// Discovery attempts on one link.
    pub discovery_attempts: u32,
    /// Delay law between discovery attempts.
    pub discovery_backoff: Backoff,
    /// Delay law between connection cycles.
    pub reconnect_backoff: Backoff,
    /// Consecutive failed reads that drop the link.
    pub poll_failure_threshold: u32,
    /// Consecutive failed cycles that flag the device.
    pub attention_threshold: u32,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(20),
            step_timeout: Duration::from_secs(10),
            discovery_attempts: 4,
            discovery_backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(5)),
            reconnect_backoff: Backoff::new(Duration::from_secs(5), Duration::from_secs(300)),
            poll_failure_threshold: 3,
            attention_threshold: 5,
        }
    }
}

/// Collaborators shared by every session of a bridge.
#[derive(Clone)]
pub struct SessionContext {
    /// Link factory.
    pub transport: Arc<dyn BleTransport>,
    /// Secret store.
    pub store: Arc<SecretStore>,
    /// Reading sink.
    pub publisher: Arc<dyn Publisher>,
    /// Handshake protocol.
    pub engine: HandshakeEngine,
    /// Target temperature curve.
    pub calibration: Arc<dyn CalibrationCurve>,
    /// Timing parameters.
    pub timings: SessionTimings,
    /// Optional shared status board.
    pub board: Option<StatusBoard>,
}

fn timed_out(operation: &str, limit: Duration) -> BridgeError {
    BluetoothError::Timeout {
        operation: operation.to_string(),
        millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
    }
    .into()
}

/// One thermostat's connection lifecycle.
pub struct DeviceSession {
    device: DeviceConfig,
    address: Option<String>,
    metadata: DeviceMetadata,
    ctx: SessionContext,
    state: SessionState,
    link: Option<Box<dyn BleLink>>,
    consecutive_failures: u32,
    poll_failures: u32,
    publish_failures: u64,
    attention: Option<String>,
    last_error: Option<&'static str>,
    discovery_published: bool,
    last_reading: Option<Reading>,
}

impl DeviceSession {
    /// A session in `Idle` for `device`.
    #[must_use]
    pub fn new(device: DeviceConfig, ctx: SessionContext) -> Self {
        let address = canonical_mac_address(&device.address);
        let metadata = Self::metadata_for(&device, address.as_deref());
        Self {
            device,
            address,
            metadata,
            ctx,
            state: SessionState::Idle,
            link: None,
            consecutive_failures: 0,
            poll_failures: 0,
            publish_failures: 0,
            attention: None,
            last_error: None,
            discovery_published: false,
            last_reading: None,
        }
    }

    // A device configured by name shows that name unless one is set explicitly.
    fn metadata_for(device: &DeviceConfig, address: Option<&str>) -> DeviceMetadata {
        let name = device.name.as_deref().or_else(|| {
            canonical_mac_address(&device.address)
                .is_none()
                .then_some(device.address.as_str())
        });
        DeviceMetadata::ensto(address.unwrap_or(&device.address), name)
    }

    /// Configured identifier.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.device.address
    }

    /// MAC address, once known.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    // Key for the secret store and MQTT topics.
    fn key(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.device.address)
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Consecutive failed connection cycles.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the device is flagged for operator attention.
    #[must_use]
    pub const fn needs_attention(&self) -> bool {
        self.attention.is_some()
    }

    /// Why the device is flagged.
    #[must_use]
    pub fn attention_reason(&self) -> Option<&str> {
        self.attention.as_deref()
    }

    /// Error code of the last failed cycle, cleared by a successful reading.
    #[must_use]
    pub const fn last_error(&self) -> Option<&'static str> {
        self.last_error
    }

    /// Last published reading.
    #[must_use]
    pub const fn last_reading(&self) -> Option<&Reading> {
        self.last_reading.as_ref()
    }

    /// Publish calls that failed over the session's lifetime.
    #[must_use]
    pub const fn publish_failures(&self) -> u64 {
        self.publish_failures
    }

    /// Snapshot for reporting.
    #[must_use]
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            identifier: self.device.address.clone(),
            address: self.address.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            needs_attention: self.attention.is_some(),
            attention_reason: self.attention.clone(),
            last_reading_at: self.last_reading.as_ref().map(|r| r.timestamp),
            last_error: self.last_error.map(str::to_string),
        }
    }

    /// Drive the session until `shutdown` flips to true or the device
    /// becomes unpollable. The link is torn down before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DeviceStatus {
        let span = info_span!("device", device = %self.device.address);
        async move {
            info!("Session started");
            self.report().await;
            loop {
                if *shutdown.borrow() || self.state == SessionState::Fatal {
                    break;
                }
                let delay = tokio::select! {
                    delay = self.step() => delay,
                    _ = shutdown.changed() => break,
                };
                if self.state == SessionState::Fatal {
                    break;
                }
                if !delay.is_zero() {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
            self.teardown().await;
            info!(state = %self.state, "Session stopped");
            self.status()
        }
        .instrument(span)
        .await
    }

    /// Perform one transition and return the delay before the next.
    pub async fn step(&mut self) -> Duration {
        let before = self.status();
        let delay = match self.state {
            SessionState::Idle => match self.unpollable() {
                Some(err) => self.fail(err.into()),
                None => {
                    self.transition(SessionState::Connecting);
                    Duration::ZERO
                }
            },
            SessionState::Connecting => self.connect().await,
            SessionState::Handshaking => self.handshake().await,
            SessionState::Polling => self.poll().await,
            SessionState::Disconnected => self.reconnect_delay().await,
            SessionState::Fatal => Duration::ZERO,
        };
        if self.status() != before {
            self.report().await;
        }
        delay
    }

    /// `Some` when no handshake can succeed: no secret stored under the
    /// device's address and capture is disabled. Undecidable for a device
    /// configured by name until its address is known.
    fn unpollable(&self) -> Option<SessionError> {
        let address = self.address.as_deref()?;
        (!self.device.allow_capture && !self.ctx.store.exists(address)).then(|| {
            SessionError::MissingSecret {
                identifier: self.device.address.clone(),
            }
        })
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }

    /// Apply the recovery policy of `err` and return the delay before the
    /// next step.
    fn fail(&mut self, err: BridgeError) -> Duration {
        let code = err.error_code();
        self.last_error = Some(code);

        if err.is_fatal() {
            error!(error = %err, code, "Device cannot be polled");
            self.attention = Some(err.to_string());
            self.transition(SessionState::Fatal);
            return Duration::ZERO;
        }

        warn!(error = %err, code, transient = err.is_transient(), "Connection cycle failed");
        if err.is_auth_error() {
            self.flag(format!("{err}; the thermostat may need pairing again"));
        } else if !err.is_transient() {
            self.flag(err.to_string());
        }
        self.transition(SessionState::Disconnected);
        Duration::ZERO
    }

    fn flag(&mut self, reason: String) {
        if self.attention.as_deref() != Some(reason.as_str()) {
            warn!(%reason, "Device needs attention");
            self.attention = Some(reason);
        }
    }

    async fn connect(&mut self) -> Duration {
        let timings = self.ctx.timings;
        let connect = timeout(
            timings.connect_timeout,
            self.ctx.transport.connect(&self.device.address),
        )
        .await;
        match connect {
            Ok(Ok(link)) => {
                self.learn_address(link.address());
                self.link = Some(link);
            }
            Ok(Err(err)) => return self.fail(err.into()),
            Err(_) => return self.fail(timed_out("connect", timings.connect_timeout)),
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(link) = self.link.as_mut() else {
                return self.fail(BluetoothError::Disconnected.into());
            };
            let result = match timeout(timings.step_timeout, link.discover_services()).await {
                Ok(result) => result,
                Err(_) => return self.fail(timed_out("service discovery", timings.step_timeout)),
            };
            match result {
                Ok(()) => break,
                Err(err) if err.is_discovery_pending() && attempt < timings.discovery_attempts => {
                    let delay = timings.discovery_backoff.delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis(), "Services not resolved, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return self.fail(err.into()),
            }
        }

        debug!(attempts = attempt, "Services resolved");
        self.transition(SessionState::Handshaking);
        Duration::ZERO
    }

    fn learn_address(&mut self, address: &str) {
        let address = canonical_mac_address(address).unwrap_or_else(|| address.to_string());
        if self.address.as_deref() == Some(address.as_str()) {
            return;
        }
        info!(%address, "Resolved device address");
        self.metadata = Self::metadata_for(&self.device, Some(&address));
        self.address = Some(address);
        self.discovery_published = false;
    }

    async fn handshake(&mut self) -> Duration {
        if let Some(err) = self.unpollable() {
            return self.fail(err.into());
        }
        let mode = match self.ctx.store.get(self.key()) {
            Some(secret) => HandshakeMode::Resume(secret),
            None => HandshakeMode::Capture,
        };

        let Some(link) = self.link.as_mut() else {
            return self.fail(BluetoothError::Disconnected.into());
        };
        match self.ctx.engine.run(link.as_mut(), mode).await {
            Ok(HandshakeOutcome::Captured(secret)) => {
                info!("Captured new Factory Reset ID");
                let key = self.key().to_string();
                if let Err(err) = self.ctx.store.put(&key, secret).await {
                    let err = BridgeError::from(err);
                    warn!(error = %err, code = err.error_code(), "Captured secret kept in memory only");
                }
                self.enter_polling()
            }
            Ok(HandshakeOutcome::Resumed) => self.enter_polling(),
            Err(err) => self.fail(err.into()),
        }
    }

    fn enter_polling(&mut self) -> Duration {
        self.poll_failures = 0;
        self.transition(SessionState::Polling);
        Duration::ZERO
    }

    async fn poll(&mut self) -> Duration {
        let timings = self.ctx.timings;
        let Some(link) = self.link.as_mut() else {
            return self.fail(BluetoothError::Disconnected.into());
        };
        let read = timeout(
            timings.step_timeout,
            link.read_characteristic(REAL_TIME_INDICATION_UUID),
        )
        .await;
        let data = match read {
            Ok(Ok(data)) => data,
            Ok(Err(err)) => return self.poll_failed(err.into()),
            Err(_) => return self.poll_failed(timed_out("real-time read", timings.step_timeout)),
        };
        self.poll_failures = 0;

        match decode_realtime(&data, self.ctx.calibration.as_ref(), Utc::now()) {
            Ok(reading) => self.publish(reading).await,
            Err(err) => {
                let err = BridgeError::from(err);
                warn!(error = %err, code = err.error_code(), "Dropping undecodable reading");
            }
        }
        timings.poll_interval
    }

    /// Transient read errors are tolerated up to the threshold; anything else
    /// ends the cycle at once.
    fn poll_failed(&mut self, err: BridgeError) -> Duration {
        if !err.is_transient() {
            return self.fail(err);
        }
        self.poll_failures += 1;
        warn!(error = %err, failures = self.poll_failures, "Poll failed");
        if self.poll_failures >= self.ctx.timings.poll_failure_threshold {
            return self.fail(err);
        }
        self.ctx.timings.poll_interval
    }

    async fn publish(&mut self, reading: Reading) {
        let publisher = Arc::clone(&self.ctx.publisher);
        let id = self.key().to_string();

        if !self.discovery_published {
            match publisher.publish_discovery(&id, &self.metadata).await {
                Ok(()) => self.discovery_published = true,
                Err(err) => {
                    self.publish_failures += 1;
                    warn!(error = %err, "Discovery publish failed");
                }
            }
        }
        match publisher.publish_state(&id, &reading).await {
            Ok(()) => debug!(
                target = reading.target_temperature,
                room = reading.room_temperature,
                floor = reading.floor_temperature,
                relay = reading.relay_active,
                "Published reading"
            ),
            Err(err) => {
                self.publish_failures += 1;
                warn!(error = %err, "State publish failed");
            }
        }

        self.last_reading = Some(reading);
        self.consecutive_failures = 0;
        self.attention = None;
        self.last_error = None;

        if self.ctx.store.has_pending_writes() {
            if let Err(err) = self.ctx.store.flush_pending().await {
                warn!(error = %err, "Secret store still not persisted");
            }
        }
    }

    async fn reconnect_delay(&mut self) -> Duration {
        self.teardown().await;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.ctx.timings.attention_threshold {
            let reason = self.attention.clone().unwrap_or_else(|| {
                format!("{} consecutive failed connection cycles", self.consecutive_failures)
            });
            self.flag(reason);
        }
        let delay = self.ctx.timings.reconnect_backoff.delay(self.consecutive_failures);
        info!(
            failures = self.consecutive_failures,
            delay_secs = delay.as_secs(),
            "Reconnecting after backoff"
        );
        self.transition(SessionState::Connecting);
        delay
    }

    async fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            match timeout(self.ctx.timings.step_timeout, link.disconnect()).await {
                Ok(Ok(())) => debug!("Link closed"),
                Ok(Err(err)) => debug!(error = %err, "Disconnect failed"),
                Err(_) => debug!("Disconnect timed out"),
            }
        }
    }

    async fn report(&mut self) {
        let status = self.status();
        if let Some(board) = &self.ctx.board {
            board
                .write()
                .await
                .insert(status.identifier.clone(), status.clone());
        }
        let key = self.key().to_string();
        if let Err(err) = self.ctx.publisher.publish_status(&key, &status).await {
            debug!(error = %err, "Status publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{MockDevice, MockTransport};
    use crate::bluetooth::{BluetoothError, FACTORY_RESET_ID_UUID};
    use crate::decoder::TargetCalibration;
    use crate::handshake::HandshakeConfig;
    use crate::publisher::recording::RecordingPublisher;
    use crate::storage::MemoryBackend;
    use crate::types::FactoryResetId;
    use tokio::time::Instant;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
    const SECRET: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    // target raw 76376, room 20.3, floor 22.1, relay on
    fn scenario_payload() -> Vec<u8> {
        vec![
            0x58, 0x2A, 0x01, 0x00, 0xCB, 0x00, 0xDD, 0x00, 0, 0, 0, 0, 0, 0x01,
        ]
    }

    fn thermostat() -> MockDevice {
        MockDevice::new(&SECRET).with_value(REAL_TIME_INDICATION_UUID, scenario_payload())
    }

    struct Harness {
        transport: MockTransport,
        backend: MemoryBackend,
        store: Arc<SecretStore>,
        publisher: RecordingPublisher,
        board: StatusBoard,
    }

    impl Harness {
        fn new(device: MockDevice) -> Self {
            let transport = MockTransport::new();
            transport.add_device(ADDRESS, device);
            let backend = MemoryBackend::new();
            let store = Arc::new(SecretStore::open(backend.clone()).unwrap());
            Self {
                transport,
                backend,
                store,
                publisher: RecordingPublisher::new(),
                board: StatusBoard::default(),
            }
        }

        fn session(&self, device: DeviceConfig) -> DeviceSession {
            let ctx = SessionContext {
                transport: Arc::new(self.transport.clone()),
                store: Arc::clone(&self.store),
                publisher: Arc::new(self.publisher.clone()),
                engine: HandshakeEngine::new(HandshakeConfig::default(), Duration::from_secs(10)),
                calibration: Arc::new(TargetCalibration::default()),
                timings: SessionTimings::default(),
                board: Some(Arc::clone(&self.board)),
            };
            DeviceSession::new(device, ctx)
        }

        fn device(&self) -> MockDevice {
            self.transport.device(ADDRESS).unwrap()
        }
    }

    async fn step_until(session: &mut DeviceSession, state: SessionState) {
        for _ in 0..10 {
            if session.state() == state {
                return;
            }
            session.step().await;
        }
        panic!("never reached {state}, stuck in {}", session.state());
    }

    #[tokio::test]
    async fn test_first_run_captures_and_publishes() {
        let h = Harness::new(thermostat().in_pairing_mode());
        let mut session = h.session(DeviceConfig::new(ADDRESS));

        step_until(&mut session, SessionState::Polling).await;
        let delay = session.step().await;

        assert_eq!(delay, Duration::from_secs(120));
        assert_eq!(session.state(), SessionState::Polling);
        assert_eq!(h.store.get(ADDRESS).unwrap().as_bytes(), &SECRET);
        assert!(h.backend.persisted().contains_key(ADDRESS));

        let messages = h.publisher.messages();
        let first_state = messages
            .iter()
            .position(|m| m.topic.ends_with("/state"))
            .unwrap();
        let first_discovery = messages
            .iter()
            .position(|m| m.topic.ends_with("/config"))
            .unwrap();
        assert!(first_discovery < first_state);

        let state = &messages[first_state];
        assert_eq!(state.topic, "ensto_bridge/AA:BB:CC:DD:EE:FF/state");
        assert_eq!(
            state.payload,
            r#"{"target_temperature":21.5,"room_temperature":20.3,"floor_temperature":22.1,"relay_active":true}"#
        );
        assert_eq!(session.consecutive_failures(), 0);
        assert!(session.last_reading().is_some());
    }

    #[tokio::test]
    async fn test_second_run_resumes_without_trigger() {
        let h = Harness::new(thermostat());
        h.store
            .put(ADDRESS, FactoryResetId::new(SECRET.to_vec()))
            .await
            .unwrap();
        let mut session = h.session(DeviceConfig::new(ADDRESS));

        step_until(&mut session, SessionState::Polling).await;
        session.step().await;

        let device = h.device();
        assert_eq!(device.writes_to(FACTORY_RESET_ID_UUID), vec![SECRET.to_vec()]);
        assert!(!device.reads.contains(&FACTORY_RESET_ID_UUID));
        assert_eq!(h.publisher.with_suffix("/state").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_retries_follow_backoff() {
        let h = Harness::new(thermostat().in_pairing_mode().with_unresolved_discoveries(3));
        let mut session = h.session(DeviceConfig::new(ADDRESS));
        session.step().await;
        assert_eq!(session.state(), SessionState::Connecting);

        let started = Instant::now();
        session.step().await;
        let elapsed = started.elapsed();

        assert_eq!(session.state(), SessionState::Handshaking);
        assert_eq!(elapsed, SessionTimings::default().discovery_backoff.total(3));
        assert_eq!(h.device().discoveries, 4);

        step_until(&mut session, SessionState::Polling).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_exhausted_disconnects() {
        let h = Harness::new(thermostat().with_unresolved_discoveries(10));
        let mut session = h.session(DeviceConfig::new(ADDRESS));
        step_until(&mut session, SessionState::Disconnected).await;
        assert_eq!(h.device().discoveries, 4);

        let delay = session.step().await;
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(delay, Duration::from_secs(5));
        assert_eq!(h.device().disconnects, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_flag() {
        let h = Harness::new(thermostat());
        let mut session = h.session(DeviceConfig::new("11:22:33:44:55:66"));
        session.step().await;

        let mut delays = Vec::new();
        for cycle in 1..=7u32 {
            session.step().await;
            assert_eq!(session.state(), SessionState::Disconnected);
            delays.push(session.step().await.as_secs());
            assert_eq!(session.consecutive_failures(), cycle);
            assert_eq!(session.needs_attention(), cycle >= 5, "cycle {cycle}");
        }
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300]);
    }

    #[tokio::test]
    async fn test_connect_error_then_recovery_resets_failures() {
        let h = Harness::new(
            thermostat()
                .in_pairing_mode()
                .with_connect_error(BluetoothError::ConnectFailed {
                    identifier: ADDRESS.to_string(),
                    message: "le-connection-abort-by-local".to_string(),
                }),
        );
        let mut session = h.session(DeviceConfig::new(ADDRESS));
        step_until(&mut session, SessionState::Disconnected).await;
        assert_eq!(session.last_error(), Some("TRANSIENT_LINK_ERROR"));
        assert!(!session.needs_attention());
        session.step().await;
        assert_eq!(session.consecutive_failures(), 1);
        assert!(h
            .publisher
            .with_suffix("/status")
            .iter()
            .any(|m| m.payload.contains(r#""last_error":"TRANSIENT_LINK_ERROR""#)));

        step_until(&mut session, SessionState::Polling).await;
        session.step().await;
        assert_eq!(session.consecutive_failures(), 0);
        assert_eq!(session.status().last_error, None);
    }

    #[tokio::test]
    async fn test_rejected_secret_is_flagged_and_kept() {
        let h = Harness::new(thermostat());
        let stale = FactoryResetId::new(vec![9, 9, 9, 9]);
        h.store.put(ADDRESS, stale.clone()).await.unwrap();
        let mut session = h.session(DeviceConfig::new(ADDRESS));

        step_until(&mut session, SessionState::Handshaking).await;
        session.step().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.needs_attention());
        assert!(session.attention_reason().unwrap().contains("rejected"));
        assert_eq!(session.last_error(), Some("AUTH_REJECTED"));
        assert_eq!(h.store.get(ADDRESS), Some(stale));

        session.step().await;
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(h.device().disconnects, 1);
    }

    #[tokio::test]
    async fn test_poll_failures_drop_link_at_threshold() {
        let timeout_err = BluetoothError::Timeout {
            operation: "read".to_string(),
            millis: 1000,
        };
        let h = Harness::new(
            thermostat()
                .in_pairing_mode()
                .with_read_error(REAL_TIME_INDICATION_UUID, timeout_err.clone())
                .with_read_error(REAL_TIME_INDICATION_UUID, timeout_err.clone())
                .with_read_error(REAL_TIME_INDICATION_UUID, timeout_err),
        );
        let mut session = h.session(DeviceConfig::new(ADDRESS));
        step_until(&mut session, SessionState::Polling).await;

        session.step().await;
        session.step().await;
        assert_eq!(session.state(), SessionState::Polling);
        session.step().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(h.publisher.with_suffix("/state").is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_reading_is_dropped() {
        let h = Harness::new(
            MockDevice::new(&SECRET)
                .in_pairing_mode()
                .with_value(REAL_TIME_INDICATION_UUID, vec![1, 2, 3, 4, 5]),
        );
        let mut session = h.session(DeviceConfig::new(ADDRESS));
        step_until(&mut session, SessionState::Polling).await;

        let delay = session.step().await;
        assert_eq!(delay, Duration::from_secs(120));
        assert_eq!(session.state(), SessionState::Polling);
        assert!(h.publisher.with_suffix("/state").is_empty());
        assert!(session.last_reading().is_none());
    }

    #[tokio::test]
    async fn test_publish_failures_are_tolerated() {
        let h = Harness::new(thermostat().in_pairing_mode());
        h.publisher.set_failing(true);
        let mut session = h.session(DeviceConfig::new(ADDRESS));
        step_until(&mut session, SessionState::Polling).await;

        session.step().await;
        assert_eq!(session.state(), SessionState::Polling);
        assert_eq!(session.publish_failures(), 2);
        assert!(session.last_reading().is_some());

        h.publisher.set_failing(false);
        session.step().await;
        assert_eq!(h.publisher.with_suffix("/config").len(), 4);
        assert_eq!(h.publisher.with_suffix("/state").len(), 1);
    }

    #[tokio::test]
    async fn test_missing_secret_without_capture_is_fatal() {
        let h = Harness::new(thermostat().in_pairing_mode());
        let device = DeviceConfig {
            allow_capture: false,
            ..DeviceConfig::new(ADDRESS)
        };
        let (_tx, rx) = watch::channel(false);

        let status = h.session(device).run(rx).await;

        assert_eq!(status.state, SessionState::Fatal);
        assert!(status.needs_attention);
        assert_eq!(status.last_error.as_deref(), Some("DEVICE_UNPOLLABLE"));
        assert_eq!(h.device().connects, 0);
        assert!(h.device().writes.is_empty());
        assert_eq!(h.board.read().await[ADDRESS].state, SessionState::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_device_without_secret_or_capture_is_fatal() {
        let h = Harness::new(thermostat());
        let device = DeviceConfig {
            allow_capture: false,
            ..DeviceConfig::new("11:22:33:44:55:66")
        };
        let (_tx, rx) = watch::channel(false);
        let started = Instant::now();

        let status = tokio::time::timeout(Duration::from_secs(3600), h.session(device).run(rx))
            .await
            .unwrap();

        assert_eq!(status.state, SessionState::Fatal);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
        let published = h.publisher.with_suffix("11:22:33:44:55:66/status");
        assert!(published.last().unwrap().payload.contains(r#""state":"fatal""#));
    }

    #[tokio::test]
    async fn test_device_configured_by_name_is_keyed_by_address() {
        const NAME: &str = "ECO16BT 535550";
        let h = Harness::new(thermostat());
        h.transport
            .add_device(NAME, thermostat().in_pairing_mode().with_address(ADDRESS));
        let mut session = h.session(DeviceConfig::new(NAME));
        assert_eq!(session.address(), None);

        step_until(&mut session, SessionState::Polling).await;
        session.step().await;

        assert_eq!(session.address(), Some(ADDRESS));
        let persisted = h.backend.persisted();
        assert_eq!(persisted.keys().collect::<Vec<_>>(), vec![ADDRESS]);
        let states = h.publisher.with_suffix("/state");
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].topic, "ensto_bridge/AA:BB:CC:DD:EE:FF/state");

        let discovery = h.publisher.with_suffix("/config");
        assert!(discovery
            .iter()
            .all(|m| m.topic.contains("ensto_AABBCCDDEEFF")));
        assert!(discovery[0].payload.contains(NAME));

        let status = session.status();
        assert_eq!(status.identifier, NAME);
        assert_eq!(status.address.as_deref(), Some(ADDRESS));
    }

    #[tokio::test]
    async fn test_device_configured_by_name_resumes_with_address_keyed_secret() {
        const NAME: &str = "ECO16BT 535550";
        let h = Harness::new(thermostat());
        h.transport
            .add_device(NAME, thermostat().with_address(ADDRESS));
        h.store
            .put(ADDRESS, FactoryResetId::new(SECRET.to_vec()))
            .await
            .unwrap();
        let device = DeviceConfig {
            allow_capture: false,
            ..DeviceConfig::new(NAME)
        };
        let mut session = h.session(device);

        step_until(&mut session, SessionState::Polling).await;

        let named = h.transport.device(NAME).unwrap();
        assert!(!named.reads.contains(&FACTORY_RESET_ID_UUID));
        assert_eq!(named.writes_to(FACTORY_RESET_ID_UUID), vec![SECRET.to_vec()]);
        assert_eq!(h.store.get(NAME), None);
    }

    #[tokio::test]
    async fn test_same_reading_published_twice_is_identical() {
        let h = Harness::new(thermostat().in_pairing_mode());
        let mut session = h.session(DeviceConfig::new(ADDRESS));
        step_until(&mut session, SessionState::Polling).await;

        session.step().await;
        session.step().await;

        let states = h.publisher.with_suffix("/state");
        assert_eq!(states.len(), 2);
        assert_eq!(states[0], states[1]);

        let reading = session.last_reading().unwrap().clone();
        let direct = RecordingPublisher::new();
        direct.publish_state(ADDRESS, &reading).await.unwrap();
        direct.publish_state(ADDRESS, &reading).await.unwrap();
        let messages = direct.messages();
        assert_eq!(messages[0], messages[1]);
        assert_eq!(messages[0], states[0]);
    }

    #[tokio::test]
    async fn test_unauthorized_read_ends_cycle_at_once() {
        let h = Harness::new(
            thermostat().in_pairing_mode().with_read_error(
                REAL_TIME_INDICATION_UUID,
                BluetoothError::NotAuthorized {
                    message: "insufficient authorization".to_string(),
                },
            ),
        );
        let mut session = h.session(DeviceConfig::new(ADDRESS));
        step_until(&mut session, SessionState::Polling).await;

        session.step().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.needs_attention());
        assert_eq!(session.last_error(), Some("AUTH_REJECTED"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_tears_link_down() {
        let h = Harness::new(thermostat().in_pairing_mode());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.session(DeviceConfig::new(ADDRESS)).run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        let status = task.await.unwrap();

        assert_eq!(status.state, SessionState::Polling);
        assert!(status.last_reading_at.is_some());
        assert_eq!(h.device().disconnects, 1);
        assert_eq!(h.publisher.with_suffix("/state").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_polling_and_flushes_later() {
        let h = Harness::new(thermostat().in_pairing_mode());
        h.backend.set_fail_writes(true);
        let mut session = h.session(DeviceConfig::new(ADDRESS));

        step_until(&mut session, SessionState::Polling).await;
        assert!(h.store.exists(ADDRESS));
        assert!(h.store.has_pending_writes());

        session.step().await;
        assert_eq!(h.publisher.with_suffix("/state").len(), 1);
        assert!(h.backend.persisted().is_empty());

        h.backend.set_fail_writes(false);
        session.step().await;
        assert!(!h.store.has_pending_writes());
        assert!(h.backend.persisted().contains_key(ADDRESS));
    }

    #[tokio::test]
    async fn test_status_is_published_on_transitions() {
        let h = Harness::new(thermostat().in_pairing_mode());
        let mut session = h.session(DeviceConfig::new(ADDRESS));
        step_until(&mut session, SessionState::Polling).await;

        let statuses = h.publisher.with_suffix("/status");
        assert!(statuses.iter().all(|m| m.retain));
        assert!(statuses
            .last()
            .unwrap()
            .payload
            .contains(r#""state":"polling""#));
        assert_eq!(h.board.read().await[ADDRESS].state, SessionState::Polling);
    }
}
