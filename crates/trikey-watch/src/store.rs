//! Local recovery record
//!
//! Remembers the recovery this device started (and the last one it
//! completed) across restarts. Only the oracle touches the store.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use trikey_core::{CompletionAuthorization, DelayPeriod, IdempotencyKey, PhysicalFactor, RecoveryId};

/// Errors from store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A recovery started by this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnRecovery {
    pub recovery_id: RecoveryId,
    pub lost_factor: PhysicalFactor,
    pub delay_period: DelayPeriod,
    /// Key used for initiate and authorize requests of this attempt
    pub idempotency_key: IdempotencyKey,
    /// Set once the trust anchor authorized completion
    #[serde(default)]
    pub authorization: Option<CompletionAuthorization>,
}

/// What the device remembers locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalRecovery {
    /// Own recovery in progress
    InFlight(OwnRecovery),
    /// Own recovery finished; keeps the trust anchor's completion report from
    /// being read as someone else's
    Completed { recovery_id: RecoveryId },
}

/// Persistence for the local recovery record.
pub trait LocalRecoveryStore: Send + Sync {
    fn persist(&self, record: &LocalRecovery) -> Result<(), StoreError>;
    /// Remove the record. Clearing an empty store succeeds.
    fn clear(&self) -> Result<(), StoreError>;
    fn read(&self) -> Result<Option<LocalRecovery>, StoreError>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct JsonFileRecoveryStore {
    path: PathBuf,
}

impl JsonFileRecoveryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl LocalRecoveryStore for JsonFileRecoveryStore {
    fn persist(&self, record: &LocalRecovery) -> Result<(), StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(record)?;
        // Write then rename so a crash never leaves a half-written record
        let tmp = self.temp_path();
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self) -> Result<Option<LocalRecovery>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

/// In-memory store with failure injection
#[derive(Debug, Default)]
pub struct MemoryRecoveryStore {
    record: Mutex<Option<LocalRecovery>>,
    failing_clears: AtomicU32,
    failing_persists: AtomicU32,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: LocalRecovery) -> Self {
        let store = Self::default();
        *store.lock() = Some(record);
        store
    }

    /// Make the next `n` calls to `clear` fail
    pub fn fail_next_clears(&self, n: u32) {
        self.failing_clears.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `persist` fail
    pub fn fail_next_persists(&self, n: u32) {
        self.failing_persists.store(n, Ordering::SeqCst);
    }

    /// Current record, bypassing failure injection
    pub fn snapshot(&self) -> Option<LocalRecovery> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<LocalRecovery>> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl LocalRecoveryStore for MemoryRecoveryStore {
    fn persist(&self, record: &LocalRecovery) -> Result<(), StoreError> {
        if Self::take_failure(&self.failing_persists) {
            return Err(StoreError::Unavailable("injected persist failure".into()));
        }
        *self.lock() = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        if Self::take_failure(&self.failing_clears) {
            return Err(StoreError::Unavailable("injected clear failure".into()));
        }
        *self.lock() = None;
        Ok(())
    }

    fn read(&self) -> Result<Option<LocalRecovery>, StoreError> {
        Ok(self.lock().clone())
    }
}
