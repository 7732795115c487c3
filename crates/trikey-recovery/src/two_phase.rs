//! Cancel-remote-then-clear-local, shared by all three machines.
//!
//! The remote phase is remembered once confirmed, so a retry after a local
//! failure never re-issues the remote effect. The oracle's next read is what
//! reconciles anything left behind.

use crate::failure::FailureCause;
use trikey_core::{IdempotencyKey, ProofOfPossession};
use trikey_watch::{CancelRequest, RecoveryStatusOracle, TrustAnchorError};

/// Local half of the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPhase {
    /// Drop the own in-flight record
    ClearLocal,
    /// Accept that our recovery was canceled elsewhere
    Acknowledge,
}

/// How one run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwoPhaseOutcome {
    /// Both phases done
    Completed,
    /// Nothing left to cancel remotely; local phase done
    AlreadyResolved,
    /// The remote side wants a fresh proof
    ProofExpired,
    /// Remote phase failed; nothing took effect
    RemoteFailed(FailureCause),
    /// Remote phase confirmed, local phase failed
    LocalFailed(FailureCause),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoPhaseCancel {
    remote: Option<CancelRequest>,
    local: LocalPhase,
    remote_confirmed: bool,
    remote_resolved_elsewhere: bool,
}

impl TwoPhaseCancel {
    /// Cancel at the trust anchor, then clear the local record.
    ///
    /// One idempotency key per attempt; it is reused by every retry.
    pub fn cancel_then_clear(proof: Option<ProofOfPossession>) -> Self {
        Self {
            remote: Some(CancelRequest {
                proof,
                idempotency_key: IdempotencyKey::generate(),
            }),
            local: LocalPhase::ClearLocal,
            remote_confirmed: false,
            remote_resolved_elsewhere: false,
        }
    }

    /// Only the local phase: acknowledge a cancellation that happened elsewhere.
    pub fn acknowledge() -> Self {
        Self {
            remote: None,
            local: LocalPhase::Acknowledge,
            remote_confirmed: true,
            remote_resolved_elsewhere: false,
        }
    }

    pub fn request(&self) -> Option<&CancelRequest> {
        self.remote.as_ref()
    }

    pub fn proof(&self) -> Option<&ProofOfPossession> {
        self.remote.as_ref().and_then(|r| r.proof.as_ref())
    }

    pub fn remote_confirmed(&self) -> bool {
        self.remote_confirmed
    }

    /// Run whichever phases have not completed yet.
    pub async fn run(&mut self, oracle: &RecoveryStatusOracle) -> TwoPhaseOutcome {
        if !self.remote_confirmed {
            if let Some(request) = &self.remote {
                match oracle
                    .trust_anchor()
                    .cancel_recovery(oracle.account(), request)
                    .await
                {
                    Ok(()) => {}
                    Err(TrustAnchorError::RecoveryAlreadyResolved) => {
                        log::info!(
                            "[{}] Nothing left to cancel at the trust anchor",
                            oracle.account()
                        );
                        self.remote_resolved_elsewhere = true;
                    }
                    Err(TrustAnchorError::ProofExpired) => return TwoPhaseOutcome::ProofExpired,
                    Err(e) => {
                        log::warn!("[{}] Cancel failed: {}", oracle.account(), e);
                        return TwoPhaseOutcome::RemoteFailed(FailureCause::from(&e));
                    }
                }
            }
            self.remote_confirmed = true;
        }

        let local = match self.local {
            LocalPhase::ClearLocal => oracle.clear_local(),
            LocalPhase::Acknowledge => oracle.acknowledge_no_longer_recovering().await,
        };
        match local {
            Ok(()) if self.remote_resolved_elsewhere => TwoPhaseOutcome::AlreadyResolved,
            Ok(()) => TwoPhaseOutcome::Completed,
            Err(e) if self.remote.is_some() => {
                log::warn!(
                    "[{}] Canceled remotely but local cleanup failed: {}",
                    oracle.account(),
                    e
                );
                TwoPhaseOutcome::LocalFailed(FailureCause::partial(&e))
            }
            // No remote phase: this is the whole operation failing
            Err(e) => TwoPhaseOutcome::LocalFailed(FailureCause::from(&e)),
        }
    }
}
