//! Trikey Recovery
//!
//! Delay-and-notify recovery for a 2-of-3 (app, hardware, server) wallet.
//!
//! # Features
//!
//! - Own recovery: initiate, wait out the delay, complete or cancel
//! - Conflict resolution: contest someone else's recovery, with a hardware
//!   proof of possession when that recovery claims the hardware is lost
//! - Acknowledging a recovery that was canceled from another device
//! - One orchestrator routing the oracle's view to exactly one machine
//!
//! # Example
//!
//! ```ignore
//! use trikey_recovery::{RecoveryContext, RecoveryOrchestrator};
//!
//! let ctx = RecoveryContext::new(oracle, nfc_session, rotator, Arc::new(SystemClock));
//! let mut orchestrator = RecoveryOrchestrator::new(ctx);
//!
//! orchestrator.sync().await;
//! if let Some(conflict) = orchestrator.conflict() {
//!     conflict.on_cancel_recovery_conflict().await?;
//! }
//! ```

mod cell;
pub mod conflict;
pub mod failure;
pub mod hardware;
pub mod no_longer;
pub mod orchestrator;
pub mod own;
pub mod rotation;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod two_phase;

pub use conflict::{ConflictMachine, ConflictState};
pub use failure::{FailureCause, FailureKind};
pub use hardware::{ExclusiveHardware, HardwareError, HardwareProofSession};
pub use no_longer::{NoLongerRecoveringMachine, NoLongerRecoveringState};
pub use orchestrator::{route, ActiveMachine, OrchestratorError, RecoveryOrchestrator, Route};
pub use own::{OwnRecoveryMachine, OwnRecoveryState};
pub use rotation::{KeyMaterialRotator, RotationError};
pub use two_phase::{TwoPhaseCancel, TwoPhaseOutcome};

use std::sync::Arc;
use trikey_core::Clock;
use trikey_watch::RecoveryStatusOracle;

/// Collaborators shared by every machine of one account
#[derive(Clone)]
pub struct RecoveryContext {
    pub oracle: Arc<RecoveryStatusOracle>,
    pub hardware: Arc<dyn HardwareProofSession>,
    pub rotator: Arc<dyn KeyMaterialRotator>,
    pub clock: Arc<dyn Clock>,
}

impl RecoveryContext {
    /// Hardware requests made through this context are serialized.
    pub fn new(
        oracle: Arc<RecoveryStatusOracle>,
        hardware: Arc<dyn HardwareProofSession>,
        rotator: Arc<dyn KeyMaterialRotator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            oracle,
            hardware: Arc::new(ExclusiveHardware::new(hardware)),
            rotator,
            clock,
        }
    }

    /// Re-read the oracle once a step has finished.
    ///
    /// A failed read is already published as an error observation; the next
    /// poll tries again.
    pub(crate) async fn refresh_after(&self, step: &str) {
        if let Err(e) = self.oracle.refresh().await {
            log::warn!(
                "[{}] Could not re-read recovery status after {}: {}",
                self.oracle.account(),
                step,
                e
            );
        }
    }
}
