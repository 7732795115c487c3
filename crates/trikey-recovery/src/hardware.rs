//! Hardware factor sessions
//!
//! Talking to the security chip is modal: one tap, one transaction. The NFC
//! command set lives behind [`HardwareProofSession`].

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use trikey_core::{Challenge, ProofOfPossession};

/// Errors from a hardware session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// The user dismissed the session
    #[error("Hardware session canceled")]
    Canceled,

    /// Another hardware transaction is outstanding
    #[error("Hardware is busy with another request")]
    Busy,

    #[error("Hardware transport error: {0}")]
    Transport(String),
}

/// Interactive proof-of-possession signing on the hardware factor.
#[async_trait]
pub trait HardwareProofSession: Send + Sync {
    async fn request_proof_of_possession(
        &self,
        challenge: Challenge,
    ) -> Result<ProofOfPossession, HardwareError>;
}

#[async_trait]
impl<T: HardwareProofSession + ?Sized> HardwareProofSession for Arc<T> {
    async fn request_proof_of_possession(
        &self,
        challenge: Challenge,
    ) -> Result<ProofOfPossession, HardwareError> {
        (**self).request_proof_of_possession(challenge).await
    }
}

/// Serializes access to a hardware session.
///
/// A second request while one is outstanding is rejected with
/// [`HardwareError::Busy`], never interleaved.
pub struct ExclusiveHardware<H> {
    session: H,
    in_use: Mutex<()>,
}

impl<H: HardwareProofSession> ExclusiveHardware<H> {
    pub fn new(session: H) -> Self {
        Self {
            session,
            in_use: Mutex::new(()),
        }
    }
}

#[async_trait]
impl<H: HardwareProofSession> HardwareProofSession for ExclusiveHardware<H> {
    async fn request_proof_of_possession(
        &self,
        challenge: Challenge,
    ) -> Result<ProofOfPossession, HardwareError> {
        let _guard = self.in_use.try_lock().map_err(|_| {
            log::warn!("Rejecting hardware request: another session is outstanding");
            HardwareError::Busy
        })?;
        self.session.request_proof_of_possession(challenge).await
    }
}
