//! Authentication handshake over an established link.
//!
//! Ensto thermostats gate every GATT read behind the Factory Reset ID:
//!
//! - **Capture**: in pairing mode (LED blinking after holding the button) the
//!   Factory Reset ID characteristic returns the secret. Outside pairing mode
//!   it returns zeros.
//! - **Resume**: writing the secret back to the same characteristic
//!   authenticates the connection. A wrong secret is refused by the device.
//!
//! The engine borrows the link from the session and never stores it.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bluetooth::{BleLink, BluetoothError, FACTORY_RESET_ID_UUID};
use crate::types::FactoryResetId;

/// Handshake failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// Services or characteristics are not available yet.
    #[error("Service unavailable during {step}: {reason}")]
    ServiceUnavailable {
        /// Step that failed.
        step: &'static str,
        /// Transport message.
        reason: String,
    },

    /// A step did not answer within the bound.
    #[error("Handshake step '{step}' timed out after {millis} ms")]
    HandshakeTimeout {
        /// Step that timed out.
        step: &'static str,
        /// The bound.
        millis: u64,
    },

    /// The device refused the stored secret. The secret is likely stale and
    /// the device must be re-paired by the operator.
    #[error("Device rejected the Factory Reset ID: {reason}")]
    HandshakeRejected {
        /// Why it was considered rejected.
        reason: String,
    },

    /// Capture did not yield a usable secret (device not in pairing mode, or
    /// a malformed read).
    #[error("Factory Reset ID capture failed: {reason}. Put the device in pairing mode.")]
    CaptureFailed {
        /// Why the capture was refused.
        reason: String,
    },

    /// Any other link failure.
    #[error(transparent)]
    Link(#[from] BluetoothError),
}

impl HandshakeError {
    /// Returns `true` for failures that are retried without operator attention.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::ServiceUnavailable { .. } | Self::HandshakeTimeout { .. } => true,
            Self::HandshakeRejected { .. } | Self::CaptureFailed { .. } => false,
            Self::Link(err) => err.is_transient(),
        }
    }

    /// Returns `true` for authentication failures that need operator attention.
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Self::HandshakeRejected { .. } | Self::CaptureFailed { .. }
        )
    }
}

/// Optional status characteristic confirming authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatusCheck {
    /// Characteristic to read after writing the secret.
    pub characteristic: Uuid,
    /// Value it reports once authenticated.
    pub authenticated: Vec<u8>,
}

/// Handshake protocol settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Minimum length of a well-formed Factory Reset ID.
    pub secret_len: usize,

    /// Bytes written to the Factory Reset ID characteristic before the capture
    /// read. Empty means no trigger write.
    pub capture_trigger: Vec<u8>,

    /// Status check after the secret write. Without one, the device accepting
    /// the write is the verdict.
    pub auth_status: Option<AuthStatusCheck>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            secret_len: 4,
            capture_trigger: Vec::new(),
            auth_status: None,
        }
    }
}

/// How to authenticate this connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMode {
    /// No secret known; read it from the device in pairing mode.
    Capture,
    /// Authenticate with a stored secret.
    Resume(FactoryResetId),
}

impl HandshakeMode {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Resume(_) => "resume",
        }
    }
}

/// Successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// A new secret was captured and used to authenticate. The caller persists it.
    Captured(FactoryResetId),
    /// The stored secret was accepted.
    Resumed,
}

/// State of one handshake run, scoped to one connection attempt.
///
/// Dropped when the attempt ends; a reconnect starts a fresh session.
pub struct HandshakeSession<'a> {
    link: &'a mut dyn BleLink,
    mode: HandshakeMode,
    step: u32,
    step_timeout: Duration,
}

impl<'a> HandshakeSession<'a> {
    /// Start a handshake on `link`.
    pub fn new(link: &'a mut dyn BleLink, mode: HandshakeMode, step_timeout: Duration) -> Self {
        Self {
            link,
            mode,
            step: 0,
            step_timeout,
        }
    }

    /// Steps started so far.
    #[must_use]
    pub const fn steps(&self) -> u32 {
        self.step
    }

    /// The mode this session runs in.
    #[must_use]
    pub const fn mode(&self) -> &HandshakeMode {
        &self.mode
    }

    async fn write(
        &mut self,
        name: &'static str,
        uuid: Uuid,
        value: &[u8],
    ) -> Result<(), HandshakeError> {
        let Self {
            link,
            step,
            step_timeout,
            ..
        } = self;
        bounded_step(step, *step_timeout, name, link.write_characteristic(uuid, value)).await
    }

    async fn read(&mut self, name: &'static str, uuid: Uuid) -> Result<Vec<u8>, HandshakeError> {
        let Self {
            link,
            step,
            step_timeout,
            ..
        } = self;
        bounded_step(step, *step_timeout, name, link.read_characteristic(uuid)).await
    }
}

/// Run one step under the timeout and classify its failure.
#[allow(clippy::cast_possible_truncation)]
async fn bounded_step<T, F>(
    counter: &mut u32,
    timeout: Duration,
    name: &'static str,
    fut: F,
) -> Result<T, HandshakeError>
where
    F: Future<Output = Result<T, BluetoothError>>,
{
    *counter += 1;
    debug!(step = *counter, name, "Handshake step");
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) if err.is_discovery_pending() => Err(HandshakeError::ServiceUnavailable {
            step: name,
            reason: err.to_string(),
        }),
        Ok(Err(BluetoothError::Timeout { millis, .. })) => {
            Err(HandshakeError::HandshakeTimeout { step: name, millis })
        }
        Ok(Err(err)) => Err(HandshakeError::Link(err)),
        Err(_) => Err(HandshakeError::HandshakeTimeout {
            step: name,
            millis: timeout.as_millis() as u64,
        }),
    }
}

/// Drives the capture and resume exchanges.
#[derive(Debug, Clone)]
pub struct HandshakeEngine {
    config: HandshakeConfig,
    step_timeout: Duration,
}

impl HandshakeEngine {
    /// Create an engine with per-step timeout `step_timeout`.
    #[must_use]
    pub const fn new(config: HandshakeConfig, step_timeout: Duration) -> Self {
        Self {
            config,
            step_timeout,
        }
    }

    /// Authenticate the link.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::CaptureFailed`] if the capture read is short or all zeros
    /// - [`HandshakeError::HandshakeRejected`] if the device refuses the secret
    /// - [`HandshakeError::ServiceUnavailable`] if the characteristics are not resolved
    /// - [`HandshakeError::HandshakeTimeout`] if a step exceeds its bound
    pub async fn run(
        &self,
        link: &mut dyn BleLink,
        mode: HandshakeMode,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let identifier = link.identifier().to_string();
        let mut session = HandshakeSession::new(link, mode, self.step_timeout);

        let outcome = match session.mode().clone() {
            HandshakeMode::Capture => {
                let secret = self.capture(&mut session).await?;
                self.authenticate(&mut session, &secret).await?;
                HandshakeOutcome::Captured(secret)
            }
            HandshakeMode::Resume(secret) => {
                self.authenticate(&mut session, &secret).await?;
                HandshakeOutcome::Resumed
            }
        };

        info!(
            %identifier,
            mode = session.mode().name(),
            steps = session.steps(),
            "Handshake completed"
        );
        Ok(outcome)
    }

    async fn capture(&self, session: &mut HandshakeSession<'_>) -> Result<FactoryResetId, HandshakeError> {
        if !self.config.capture_trigger.is_empty() {
            session
                .write("capture trigger", FACTORY_RESET_ID_UUID, &self.config.capture_trigger)
                .await
                .map_err(capture_failure)?;
        }

        let bytes = session
            .read("capture read", FACTORY_RESET_ID_UUID)
            .await
            .map_err(capture_failure)?;

        if bytes.len() < self.config.secret_len {
            return Err(HandshakeError::CaptureFailed {
                reason: format!(
                    "expected at least {} bytes, got {}",
                    self.config.secret_len,
                    bytes.len()
                ),
            });
        }

        let secret = FactoryResetId::new(bytes);
        if secret.is_all_zero() {
            warn!("Factory Reset ID read as all zeros; device is not in pairing mode");
            return Err(HandshakeError::CaptureFailed {
                reason: "device returned an all-zero ID".to_string(),
            });
        }

        info!(len = secret.len(), "Captured new Factory Reset ID");
        Ok(secret)
    }

    async fn authenticate(
        &self,
        session: &mut HandshakeSession<'_>,
        secret: &FactoryResetId,
    ) -> Result<(), HandshakeError> {
        session
            .write("secret write", FACTORY_RESET_ID_UUID, secret.as_bytes())
            .await
            .map_err(rejection)?;

        if let Some(check) = &self.config.auth_status {
            let status = session
                .read("status read", check.characteristic)
                .await
                .map_err(rejection)?;
            if status != check.authenticated {
                return Err(HandshakeError::HandshakeRejected {
                    reason: format!("unexpected status {}", hex::encode(&status)),
                });
            }
        }
        Ok(())
    }
}

/// A refused read of the ID means the device is not in pairing mode.
fn capture_failure(err: HandshakeError) -> HandshakeError {
    match err {
        HandshakeError::Link(BluetoothError::NotAuthorized { message }) => {
            HandshakeError::CaptureFailed { reason: message }
        }
        other => other,
    }
}

fn rejection(err: HandshakeError) -> HandshakeError {
    match err {
        HandshakeError::Link(BluetoothError::NotAuthorized { message }) => {
            HandshakeError::HandshakeRejected { reason: message }
        }
        other => other,
    }
}
