//! Persistent storage for Factory Reset IDs.
//!
//! The [`SecretStore`] keeps every captured secret in memory and writes the
//! whole map through a [`SecretBackend`] on each `put`. The default backend is
//! a JSON file replaced atomically (temp file + rename), so a crash mid-write
//! leaves the previous file intact.
//!
//! File format:
//!
//! ```json
//! {
//!   "AA:BB:CC:DD:EE:FF": { "secret": "0a1b2c3d", "captured_at": "2025-01-15T03:30:00Z" }
//! }
//! ```
//!
//! Files written by the first bridge version (`{ "AA:BB:CC:DD:EE:FF": "0a1b2c3d" }`)
//! load as well and are rewritten in the current format on the next `put`.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::FactoryResetId;

/// Secret store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store file exists but cannot be read.
    #[error("Failed to read secret store {}: {source}", path.display())]
    ReadError {
        /// Store path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The store file is not valid. Secrets cannot be guessed, so this is fatal.
    #[error("Secret store {} is corrupt: {message}", path.display())]
    Corrupt {
        /// Store path.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// The durable write failed; the in-memory copy is still valid.
    #[error("Failed to write secret store {}: {source}", path.display())]
    WriteError {
        /// Store path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization failed.
    #[error("Failed to serialize secret store: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One persisted secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    /// The Factory Reset ID.
    pub secret: FactoryResetId,
    /// When it was captured. `None` for records migrated from the legacy format.
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    captured_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Record(StoredRecord),
    Legacy(String),
}

/// Durable backing for the secret map.
pub trait SecretBackend: Send + Sync {
    /// Load every record. A missing store is empty, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store exists but cannot be read or parsed.
    fn load(&self) -> StorageResult<HashMap<String, SecretRecord>>;

    /// Replace the stored map with `records`, atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the write did not land. The previous state must be
    /// left untouched in that case.
    fn persist(&self, records: &HashMap<String, SecretRecord>) -> StorageResult<()>;
}

/// JSON file backend with atomic replace.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    /// Use the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, message: impl Into<String>) -> StorageError {
        StorageError::Corrupt {
            path: self.path.clone(),
            message: message.into(),
        }
    }

    fn write_error(&self, source: std::io::Error) -> StorageError {
        StorageError::WriteError {
            path: self.path.clone(),
            source,
        }
    }
}

impl SecretBackend for JsonFileBackend {
    fn load(&self) -> StorageResult<HashMap<String, SecretRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No secret store yet");
                return Ok(HashMap::new());
            }
            Err(source) => {
                return Err(StorageError::ReadError {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Err(self.corrupt("file is empty"));
        }

        let entries: BTreeMap<String, StoredEntry> =
            serde_json::from_str(&content).map_err(|e| self.corrupt(e.to_string()))?;

        let mut records = HashMap::with_capacity(entries.len());
        for (identifier, entry) in entries {
            let (hex_secret, captured_at) = match entry {
                StoredEntry::Record(r) => (r.secret, r.captured_at),
                StoredEntry::Legacy(hex_secret) => (hex_secret, None),
            };
            let secret = FactoryResetId::from_hex(&hex_secret)
                .map_err(|e| self.corrupt(format!("{identifier}: {e}")))?;
            if secret.is_empty() {
                return Err(self.corrupt(format!("{identifier}: empty secret")));
            }
            records.insert(
                identifier,
                SecretRecord {
                    secret,
                    captured_at,
                },
            );
        }
        Ok(records)
    }

    fn persist(&self, records: &HashMap<String, SecretRecord>) -> StorageResult<()> {
        let sorted: BTreeMap<&str, StoredRecord> = records
            .iter()
            .map(|(id, record)| {
                (
                    id.as_str(),
                    StoredRecord {
                        secret: record.secret.to_hex(),
                        captured_at: record.captured_at,
                    },
                )
            })
            .collect();
        let content = serde_json::to_string_pretty(&sorted)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| self.write_error(e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| self.write_error(e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| self.write_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.write_error(e))?;
        tmp.persist(&self.path)
            .map_err(|e| self.write_error(e.error))?;
        Ok(())
    }
}

/// In-memory backend, optionally failing writes on demand.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<HashMap<String, SecretRecord>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// An empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `persist` calls fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// What has durably landed so far.
    #[must_use]
    pub fn persisted(&self) -> HashMap<String, SecretRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl SecretBackend for MemoryBackend {
    fn load(&self) -> StorageResult<HashMap<String, SecretRecord>> {
        Ok(self.persisted())
    }

    fn persist(&self, records: &HashMap<String, SecretRecord>) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteError {
                path: PathBuf::from("<memory>"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "simulated write failure"),
            });
        }
        *self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = records.clone();
        Ok(())
    }
}

/// Device identifier to Factory Reset ID map, shared by all sessions.
pub struct SecretStore {
    backend: Arc<dyn SecretBackend>,
    records: RwLock<HashMap<String, SecretRecord>>,
    // Serializes mutations and durable writes.
    write_lock: tokio::sync::Mutex<()>,
    dirty: AtomicBool,
}

impl SecretStore {
    /// Load the store from `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the existing store cannot be read or is corrupt.
    pub fn open(backend: impl SecretBackend + 'static) -> StorageResult<Self> {
        let records = backend.load()?;
        info!(count = records.len(), "Loaded stored Factory Reset IDs");
        Ok(Self {
            backend: Arc::new(backend),
            records: RwLock::new(records),
            write_lock: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
        })
    }

    /// Open the JSON file store at `path`.
    ///
    /// # Errors
    ///
    /// See [`SecretStore::open`].
    pub fn open_file(path: impl Into<PathBuf>) -> StorageResult<Self> {
        Self::open(JsonFileBackend::new(path))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SecretRecord>> {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The stored secret for `identifier`.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<FactoryResetId> {
        self.read().get(identifier).map(|r| r.secret.clone())
    }

    /// The full record for `identifier`.
    #[must_use]
    pub fn record(&self, identifier: &str) -> Option<SecretRecord> {
        self.read().get(identifier).cloned()
    }

    /// Whether a secret is stored for `identifier`.
    #[must_use]
    pub fn exists(&self, identifier: &str) -> bool {
        self.read().contains_key(identifier)
    }

    /// Whether a previous durable write failed and has not been retried yet.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Store a freshly captured secret and write it through.
    ///
    /// The in-memory record is updated even when the durable write fails, so
    /// the current session keeps working; the write is retried by
    /// [`SecretStore::flush_pending`].
    ///
    /// # Errors
    ///
    /// Returns the backend error if the durable write did not land.
    pub async fn put(&self, identifier: &str, secret: FactoryResetId) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;

        let snapshot = {
            let mut records = self
                .records
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            records.insert(
                identifier.to_string(),
                SecretRecord {
                    secret,
                    captured_at: Some(Utc::now()),
                },
            );
            records.clone()
        };

        self.write_snapshot(snapshot).await
    }

    /// Retry a durable write that failed earlier. No-op when nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the retry failed too.
    pub async fn flush_pending(&self) -> StorageResult<()> {
        if !self.has_pending_writes() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        if !self.has_pending_writes() {
            return Ok(());
        }
        let snapshot = self.read().clone();
        self.write_snapshot(snapshot).await?;
        info!("Pending Factory Reset ID write persisted");
        Ok(())
    }

    // File I/O and fsync run on the blocking pool.
    async fn write_snapshot(&self, snapshot: HashMap<String, SecretRecord>) -> StorageResult<()> {
        let backend = Arc::clone(&self.backend);
        let written = tokio::task::spawn_blocking(move || backend.persist(&snapshot))
            .await
            .unwrap_or_else(|join| {
                Err(StorageError::WriteError {
                    path: PathBuf::from("<blocking task>"),
                    source: std::io::Error::other(join.to_string()),
                })
            });
        match written {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                self.dirty.store(true, Ordering::SeqCst);
                warn!(error = %err, "Secret store write failed; keeping in-memory copy");
                Err(err)
            }
        }
    }
}

/// Default store location.
///
/// On Linux: `/var/lib/ensto-bridge/devices.json`
/// Elsewhere: the platform data directory.
#[must_use]
pub fn default_storage_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/ensto-bridge/devices.json")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "ensto-bridge").map_or_else(
            || PathBuf::from("ensto_devices.json"),
            |dirs| dirs.data_dir().join("devices.json"),
        )
    }
}
