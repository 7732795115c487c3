//! Trikey Watch
//!
//! The recovery status oracle: the single source of truth for "what recovery
//! is going on for this account", as seen from this device.
//!
//! # Features
//!
//! - Polls the trust anchor and combines the report with the local record
//! - Publishes every observation (including read errors) to subscribers
//! - Owns all writes to the local recovery record
//!
//! # Example
//!
//! ```ignore
//! use trikey_watch::{JsonFileRecoveryStore, RecoveryStatusOracle, WatchConfig};
//!
//! let store = Arc::new(JsonFileRecoveryStore::new("~/.trikey/recovery.json"));
//! let oracle = Arc::new(RecoveryStatusOracle::new(account, trust_anchor, store));
//!
//! // Poll in the background
//! tokio::spawn({
//!     let oracle = oracle.clone();
//!     async move { oracle.watch(&WatchConfig::default()).await }
//! });
//!
//! let mut observations = Box::pin(oracle.observe());
//! while let Some(observation) = observations.next().await {
//!     println!("Recovery: {:?}", observation);
//! }
//! ```

pub mod anchor;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod view;

pub use anchor::{
    CancelRequest, InitiatedRecovery, ServerRecovery, TrustAnchorError, TrustAnchorRecoveryClient,
};
pub use store::{
    JsonFileRecoveryStore, LocalRecovery, LocalRecoveryStore, MemoryRecoveryStore, OwnRecovery,
    StoreError,
};
pub use view::derive_recovery;

use futures::Stream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use trikey_core::{AccountId, CompletionAuthorization, Recovery, RecoveryId};

/// Errors from the oracle.
///
/// Cloneable so they can be published to every observer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("Trust anchor error: {0}")]
    TrustAnchor(#[from] TrustAnchorError),

    #[error("Local store error: {0}")]
    Store(String),

    #[error("No own recovery recorded")]
    NoOwnRecovery,

    #[error("Own recovery {0} is still active; refusing to discard it")]
    StillRecovering(RecoveryId),

    #[error("Recovery view is {0:?}; nothing canceled elsewhere to acknowledge")]
    NotNoLongerRecovering(Recovery),

    #[error("Poll interval too short (minimum {min} seconds)")]
    PollTooFrequent { min: u64 },
}

impl From<StoreError> for OracleError {
    fn from(e: StoreError) -> Self {
        OracleError::Store(e.to_string())
    }
}

/// One observation: the derived recovery view, or why it could not be read
pub type Observation = Result<Recovery, OracleError>;

/// Configuration for the oracle's polling loop
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Path to the local recovery record
    pub state_path: PathBuf,
    /// Poll interval in seconds
    pub poll_interval_secs: u64,
    /// Minimum allowed poll interval (rate limiting)
    pub min_poll_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("recovery_state.json"),
            poll_interval_secs: 600,    // 10 minutes
            min_poll_interval_secs: 60, // 1 minute minimum
        }
    }
}

/// Recovery status oracle for one account.
pub struct RecoveryStatusOracle {
    account: AccountId,
    trust_anchor: Arc<dyn TrustAnchorRecoveryClient>,
    store: Arc<dyn LocalRecoveryStore>,
    latest: watch::Sender<Option<Observation>>,
}

impl RecoveryStatusOracle {
    pub fn new(
        account: AccountId,
        trust_anchor: Arc<dyn TrustAnchorRecoveryClient>,
        store: Arc<dyn LocalRecoveryStore>,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            account,
            trust_anchor,
            store,
            latest,
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn trust_anchor(&self) -> &Arc<dyn TrustAnchorRecoveryClient> {
        &self.trust_anchor
    }

    /// Continuous stream of observations.
    ///
    /// Starts with the latest observation (if any) and yields every
    /// subsequent one. Ends when the oracle is dropped.
    pub fn observe(&self) -> impl Stream<Item = Observation> + Send + 'static {
        let rx = self.latest.subscribe();
        futures::stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(observation) = current {
                    return Some((observation, (rx, false)));
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
    }

    /// The latest observation, if any read happened yet
    pub fn current(&self) -> Option<Observation> {
        self.latest.borrow().clone()
    }

    /// Read the trust anchor and local record once and publish the result.
    pub async fn refresh(&self) -> Observation {
        let observation = self.read_view().await;
        match &observation {
            Ok(recovery) => log::debug!("[{}] Recovery view: {:?}", self.account, recovery),
            Err(e) => log::warn!("[{}] Failed to read recovery status: {}", self.account, e),
        }
        self.latest.send_replace(Some(observation.clone()));
        observation
    }

    async fn read_view(&self) -> Observation {
        let server = self.trust_anchor.fetch_recovery(&self.account).await?;
        let local = self.store.read()?;
        Ok(derive_recovery(&server, local.as_ref()))
    }

    /// Poll forever at the configured interval.
    ///
    /// Read errors are published and retried on the next tick.
    pub async fn watch(&self, config: &WatchConfig) -> Result<(), OracleError> {
        if config.poll_interval_secs < config.min_poll_interval_secs {
            return Err(OracleError::PollTooFrequent {
                min: config.min_poll_interval_secs,
            });
        }
        let mut interval = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let _ = self.refresh().await;
        }
    }

    /// The own recovery record, if one is in flight
    pub fn own_recovery(&self) -> Result<Option<OwnRecovery>, OracleError> {
        match self.store.read()? {
            Some(LocalRecovery::InFlight(own)) => Ok(Some(own)),
            _ => Ok(None),
        }
    }

    /// Remember a recovery this device just started.
    pub fn record_initiated(&self, own: OwnRecovery) -> Result<(), OracleError> {
        log::info!(
            "[{}] Recording own recovery {} (lost factor: {})",
            self.account,
            own.recovery_id,
            own.lost_factor
        );
        self.persist(&LocalRecovery::InFlight(own))
    }

    /// Attach the trust anchor's completion authorization to the own record.
    pub fn record_authorization(
        &self,
        authorization: &CompletionAuthorization,
    ) -> Result<(), OracleError> {
        let mut own = self.own_recovery()?.ok_or(OracleError::NoOwnRecovery)?;
        if own.recovery_id != authorization.recovery_id {
            return Err(OracleError::NoOwnRecovery);
        }
        own.authorization = Some(authorization.clone());
        self.persist(&LocalRecovery::InFlight(own))
    }

    /// Mark the own recovery as finished.
    pub fn record_completed(&self, recovery_id: &RecoveryId) -> Result<(), OracleError> {
        log::info!("[{}] Own recovery {} completed", self.account, recovery_id);
        self.persist(&LocalRecovery::Completed {
            recovery_id: recovery_id.clone(),
        })
    }

    /// Remove the own in-flight record. Idempotent.
    ///
    /// A completion marker is kept: it is what tells our own past completion
    /// apart from someone else's.
    pub fn clear_local(&self) -> Result<(), OracleError> {
        match self.store.read()? {
            Some(LocalRecovery::InFlight(own)) => {
                self.store.clear().map_err(|e| {
                    log::error!(
                        "[{}] Failed to clear local recovery {}: {}",
                        self.account,
                        own.recovery_id,
                        e
                    );
                    OracleError::from(e)
                })?;
                log::info!(
                    "[{}] Cleared local recovery {}",
                    self.account,
                    own.recovery_id
                );
                Ok(())
            }
            Some(LocalRecovery::Completed { .. }) | None => Ok(()),
        }
    }

    /// Accept that our own recovery was canceled elsewhere and purge it.
    ///
    /// Reads the trust anchor afresh; a cached view may be stale or missing.
    pub async fn acknowledge_no_longer_recovering(&self) -> Result<(), OracleError> {
        match self.read_view().await? {
            Recovery::NoLongerRecovering { .. } => self.clear_local(),
            // Already purged
            Recovery::NoActiveRecovery => Ok(()),
            Recovery::StillRecovering { .. } => {
                let id = self
                    .own_recovery()?
                    .map(|own| own.recovery_id)
                    .unwrap_or_else(|| RecoveryId::new("unknown"));
                Err(OracleError::StillRecovering(id))
            }
            other => Err(OracleError::NotNoLongerRecovering(other)),
        }
    }

    fn persist(&self, record: &LocalRecovery) -> Result<(), OracleError> {
        self.store.persist(record).map_err(|e| {
            log::error!("[{}] Failed to persist local recovery: {}", self.account, e);
            OracleError::from(e)
        })
    }
}
