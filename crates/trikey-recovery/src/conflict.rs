//! Contesting a recovery someone else started.
//!
//! Whoever contests a recovery that claims the *hardware* is lost must prove
//! they hold it: a fresh proof of possession over a trust-anchor challenge is
//! collected before any cancel request goes out. A recovery claiming the
//! *app* is lost is contested directly; the running app is the proof.

use crate::cell::StateCell;
use crate::failure::{invariant_violation, FailureCause, FailureKind};
use crate::hardware::HardwareError;
use crate::two_phase::{TwoPhaseCancel, TwoPhaseOutcome};
use crate::RecoveryContext;
use tokio::sync::watch;
use trikey_core::{Challenge, PhysicalFactor, ProofOfPossession};
use trikey_watch::TrustAnchorError;

const MACHINE: &str = "conflict";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictState {
    ShowingConflict {
        lost_factor: PhysicalFactor,
    },
    AwaitingHardwareProofOfPossession {
        lost_factor: PhysicalFactor,
        challenge: Challenge,
    },
    CancelingConflictingRecovery {
        lost_factor: PhysicalFactor,
        proof: Option<ProofOfPossession>,
    },
    CancelingFailed {
        lost_factor: PhysicalFactor,
        proof: Option<ProofOfPossession>,
        cause: FailureCause,
    },
    Done {
        lost_factor: PhysicalFactor,
    },
}

impl ConflictState {
    pub fn lost_factor(&self) -> PhysicalFactor {
        match self {
            ConflictState::ShowingConflict { lost_factor }
            | ConflictState::AwaitingHardwareProofOfPossession { lost_factor, .. }
            | ConflictState::CancelingConflictingRecovery { lost_factor, .. }
            | ConflictState::CancelingFailed { lost_factor, .. }
            | ConflictState::Done { lost_factor } => *lost_factor,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConflictState::Done { .. })
    }
}

pub struct ConflictMachine {
    ctx: RecoveryContext,
    lost_factor: PhysicalFactor,
    cancel: Option<TwoPhaseCancel>,
    state: StateCell<ConflictState>,
}

impl ConflictMachine {
    pub fn new(ctx: RecoveryContext, lost_factor: PhysicalFactor) -> Self {
        log::warn!(
            "[{}] Someone else is recovering (claims lost factor: {})",
            ctx.oracle.account(),
            lost_factor
        );
        Self {
            ctx,
            lost_factor,
            cancel: None,
            state: StateCell::new(MACHINE, ConflictState::ShowingConflict { lost_factor }),
        }
    }

    pub fn state(&self) -> ConflictState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConflictState> {
        self.state.subscribe()
    }

    pub fn lost_factor(&self) -> PhysicalFactor {
        self.lost_factor
    }

    /// The user chose to contest the recovery.
    ///
    /// Fails without leaving `ShowingConflict` if no challenge could be
    /// fetched for the hardware proof.
    pub async fn on_cancel_recovery_conflict(&mut self) -> Result<ConflictState, FailureCause> {
        let state = self.state.get();
        if !matches!(state, ConflictState::ShowingConflict { .. }) {
            invariant_violation(MACHINE, "on_cancel_recovery_conflict", &state);
            return Ok(state);
        }

        if self.lost_factor.requires_hardware_proof_to_contest() {
            let challenge = self.fetch_challenge().await?;
            Ok(self.transition(ConflictState::AwaitingHardwareProofOfPossession {
                lost_factor: self.lost_factor,
                challenge,
            }))
        } else {
            self.cancel = Some(TwoPhaseCancel::cancel_then_clear(None));
            Ok(self.run_cancel().await)
        }
    }

    /// Run the hardware session for the outstanding challenge.
    ///
    /// A dismissed session returns to `ShowingConflict`; a busy or broken
    /// one leaves the machine waiting so the user can tap again.
    pub async fn request_proof(&mut self) -> Result<ConflictState, FailureCause> {
        let state = self.state.get();
        let ConflictState::AwaitingHardwareProofOfPossession { challenge, .. } = state else {
            invariant_violation(MACHINE, "request_proof", &state);
            return Ok(state);
        };

        match self.ctx.hardware.request_proof_of_possession(challenge).await {
            Ok(proof) => Ok(self.on_complete(proof).await),
            Err(HardwareError::Canceled) => Ok(self.on_cancel()),
            Err(e) => {
                log::warn!("Hardware proof of possession failed: {}", e);
                Err(FailureCause::new(FailureKind::Transient, e.to_string()))
            }
        }
    }

    /// A proof of possession was collected; send the cancel.
    pub async fn on_complete(&mut self, proof: ProofOfPossession) -> ConflictState {
        let state = self.state.get();
        let ConflictState::AwaitingHardwareProofOfPossession { challenge, .. } = &state else {
            invariant_violation(MACHINE, "on_complete", &state);
            return state;
        };
        if proof.ensure_factor(PhysicalFactor::Hardware).is_err() || proof.challenge != *challenge
        {
            invariant_violation(MACHINE, "on_complete with a foreign proof", &state);
            return state;
        }

        self.cancel = Some(TwoPhaseCancel::cancel_then_clear(Some(proof)));
        self.run_cancel().await
    }

    /// The user backed out of the hardware session.
    pub fn on_cancel(&mut self) -> ConflictState {
        let state = self.state.get();
        if !matches!(state, ConflictState::AwaitingHardwareProofOfPossession { .. }) {
            invariant_violation(MACHINE, "on_cancel", &state);
            return state;
        }
        self.transition(ConflictState::ShowingConflict {
            lost_factor: self.lost_factor,
        })
    }

    /// Re-send the failed cancel with the same proof and idempotency key.
    pub async fn retry(&mut self) -> ConflictState {
        let state = self.state.get();
        if !matches!(state, ConflictState::CancelingFailed { .. }) {
            invariant_violation(MACHINE, "retry", &state);
            return state;
        }
        self.run_cancel().await
    }

    /// Abandon this cancellation attempt.
    pub fn rollback(&mut self) -> ConflictState {
        let state = self.state.get();
        if !matches!(state, ConflictState::CancelingFailed { .. }) {
            invariant_violation(MACHINE, "rollback", &state);
            return state;
        }
        self.cancel = None;
        self.transition(ConflictState::ShowingConflict {
            lost_factor: self.lost_factor,
        })
    }

    async fn fetch_challenge(&self) -> Result<Challenge, FailureCause> {
        let oracle = &self.ctx.oracle;
        oracle
            .trust_anchor()
            .request_cancel_challenge(oracle.account())
            .await
            .map_err(|e| {
                log::warn!("[{}] Failed to fetch cancel challenge: {}", oracle.account(), e);
                FailureCause::from(&e)
            })
    }

    async fn run_cancel(&mut self) -> ConflictState {
        let lost_factor = self.lost_factor;
        let mut op = self
            .cancel
            .take()
            .unwrap_or_else(|| TwoPhaseCancel::cancel_then_clear(None));
        let proof = op.proof().cloned();
        self.transition(ConflictState::CancelingConflictingRecovery {
            lost_factor,
            proof: proof.clone(),
        });

        match op.run(&self.ctx.oracle).await {
            TwoPhaseOutcome::Completed | TwoPhaseOutcome::AlreadyResolved => {
                let done = self.transition(ConflictState::Done { lost_factor });
                self.ctx.refresh_after("conflict cancel").await;
                done
            }
            TwoPhaseOutcome::ProofExpired if lost_factor.requires_hardware_proof_to_contest() => {
                log::info!("Proof of possession expired; collecting a fresh one");
                match self.fetch_challenge().await {
                    Ok(challenge) => self.transition(
                        ConflictState::AwaitingHardwareProofOfPossession {
                            lost_factor,
                            challenge,
                        },
                    ),
                    Err(cause) => {
                        self.cancel = Some(op);
                        self.transition(ConflictState::CancelingFailed {
                            lost_factor,
                            proof,
                            cause,
                        })
                    }
                }
            }
            TwoPhaseOutcome::ProofExpired => {
                self.cancel = Some(op);
                self.transition(ConflictState::CancelingFailed {
                    lost_factor,
                    proof,
                    cause: FailureCause::from(&TrustAnchorError::ProofExpired),
                })
            }
            TwoPhaseOutcome::RemoteFailed(cause) | TwoPhaseOutcome::LocalFailed(cause) => {
                self.cancel = Some(op);
                self.transition(ConflictState::CancelingFailed {
                    lost_factor,
                    proof,
                    cause,
                })
            }
        }
    }

    fn transition(&self, next: ConflictState) -> ConflictState {
        self.state.set(next.clone());
        next
    }
}
