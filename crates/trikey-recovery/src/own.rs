//! Own-recovery lifecycle
//!
//! A recovery this device started: initiate it, wait out the server-set
//! delay, then complete it (authorize + rotate keys) or cancel it.
//!
//! Delay math always reads the injected clock at the moment it is asked;
//! nothing here counts down on its own while the app is suspended.

use crate::cell::StateCell;
use crate::failure::{invariant_violation, FailureCause, FailureKind};
use crate::rotation::RotationError;
use crate::two_phase::{TwoPhaseCancel, TwoPhaseOutcome};
use crate::RecoveryContext;
use std::time::Duration;
use tokio::sync::watch;
use trikey_core::{
    CompletionAuthorization, DelayPeriod, IdempotencyKey, PhysicalFactor, RecoveryId,
};
use trikey_watch::{OwnRecovery, TrustAnchorError};

const MACHINE: &str = "own-recovery";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnRecoveryState {
    Initiating {
        lost_factor: PhysicalFactor,
    },
    InitiationFailed {
        lost_factor: PhysicalFactor,
        cause: FailureCause,
    },
    WaitingForDelayPeriod {
        lost_factor: PhysicalFactor,
        recovery_id: RecoveryId,
        delay_period: DelayPeriod,
    },
    ReadyToComplete {
        lost_factor: PhysicalFactor,
        recovery_id: RecoveryId,
        delay_period: DelayPeriod,
    },
    Completing {
        lost_factor: PhysicalFactor,
        recovery_id: RecoveryId,
        delay_period: DelayPeriod,
    },
    CompletingFailed {
        lost_factor: PhysicalFactor,
        recovery_id: RecoveryId,
        delay_period: DelayPeriod,
        cause: FailureCause,
    },
    Canceling {
        previous: Box<OwnRecoveryState>,
    },
    CancelingFailed {
        previous: Box<OwnRecoveryState>,
        cause: FailureCause,
    },
    Canceled {
        lost_factor: PhysicalFactor,
    },
    Done {
        lost_factor: PhysicalFactor,
    },
}

impl OwnRecoveryState {
    pub fn lost_factor(&self) -> PhysicalFactor {
        match self {
            OwnRecoveryState::Initiating { lost_factor }
            | OwnRecoveryState::InitiationFailed { lost_factor, .. }
            | OwnRecoveryState::WaitingForDelayPeriod { lost_factor, .. }
            | OwnRecoveryState::ReadyToComplete { lost_factor, .. }
            | OwnRecoveryState::Completing { lost_factor, .. }
            | OwnRecoveryState::CompletingFailed { lost_factor, .. }
            | OwnRecoveryState::Canceled { lost_factor }
            | OwnRecoveryState::Done { lost_factor } => *lost_factor,
            OwnRecoveryState::Canceling { previous }
            | OwnRecoveryState::CancelingFailed { previous, .. } => previous.lost_factor(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OwnRecoveryState::Canceled { .. } | OwnRecoveryState::Done { .. }
        )
    }

    /// Not yet known to the trust anchor
    pub fn is_pre_initiation(&self) -> bool {
        matches!(
            self,
            OwnRecoveryState::Initiating { .. } | OwnRecoveryState::InitiationFailed { .. }
        )
    }
}

/// Drives one recovery attempt started on this device.
pub struct OwnRecoveryMachine {
    ctx: RecoveryContext,
    lost_factor: PhysicalFactor,
    /// One key per attempt, shared by initiate and authorize
    idempotency_key: IdempotencyKey,
    initiate_sent: bool,
    authorization: Option<CompletionAuthorization>,
    rotated: bool,
    cancel: Option<TwoPhaseCancel>,
    state: StateCell<OwnRecoveryState>,
}

impl OwnRecoveryMachine {
    /// A fresh attempt, not yet sent.
    pub fn begin(ctx: RecoveryContext, lost_factor: PhysicalFactor) -> Self {
        Self {
            ctx,
            lost_factor,
            idempotency_key: IdempotencyKey::generate(),
            initiate_sent: false,
            authorization: None,
            rotated: false,
            cancel: None,
            state: StateCell::new(MACHINE, OwnRecoveryState::Initiating { lost_factor }),
        }
    }

    /// Rebuild from the persisted record after a restart.
    ///
    /// Lands directly in `ReadyToComplete` when the delay already ended.
    pub fn resume(ctx: RecoveryContext, own: OwnRecovery) -> Self {
        let elapsed =
            own.authorization.is_some() || own.delay_period.is_elapsed(ctx.clock.now());
        let initial = if elapsed {
            OwnRecoveryState::ReadyToComplete {
                lost_factor: own.lost_factor,
                recovery_id: own.recovery_id.clone(),
                delay_period: own.delay_period,
            }
        } else {
            OwnRecoveryState::WaitingForDelayPeriod {
                lost_factor: own.lost_factor,
                recovery_id: own.recovery_id.clone(),
                delay_period: own.delay_period,
            }
        };
        log::info!(
            "Resuming own recovery {} ({:?})",
            own.recovery_id,
            initial
        );
        Self {
            ctx,
            lost_factor: own.lost_factor,
            idempotency_key: own.idempotency_key,
            initiate_sent: true,
            authorization: own.authorization,
            rotated: false,
            cancel: None,
            state: StateCell::new(MACHINE, initial),
        }
    }

    pub fn state(&self) -> OwnRecoveryState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<OwnRecoveryState> {
        self.state.subscribe()
    }

    pub fn lost_factor(&self) -> PhysicalFactor {
        self.lost_factor
    }

    /// Time left on the delay, read from the clock now
    pub fn remaining(&self) -> Option<Duration> {
        self.delay_period()
            .map(|delay| delay.remaining(self.ctx.clock.now()))
    }

    /// Fraction of the delay that has passed, read from the clock now
    pub fn progress(&self) -> Option<f64> {
        self.delay_period()
            .map(|delay| delay.progress(self.ctx.clock.now()))
    }

    /// Delay bounds the machine is counting down, if it is waiting or ready
    pub fn delay_period(&self) -> Option<DelayPeriod> {
        match self.state.get() {
            OwnRecoveryState::WaitingForDelayPeriod { delay_period, .. }
            | OwnRecoveryState::ReadyToComplete { delay_period, .. } => Some(delay_period),
            _ => None,
        }
    }

    /// Not recorded locally, but an initiate request may have reached the
    /// trust anchor under this attempt's key.
    pub fn may_have_landed(&self) -> bool {
        self.initiate_sent && self.state.get().is_pre_initiation()
    }

    /// Send the initiate request.
    pub async fn initiate(&mut self) -> OwnRecoveryState {
        let state = self.state.get();
        if !matches!(state, OwnRecoveryState::Initiating { .. }) {
            invariant_violation(MACHINE, "initiate", &state);
            return state;
        }
        self.send_initiate().await
    }

    async fn send_initiate(&mut self) -> OwnRecoveryState {
        let lost_factor = self.lost_factor;
        self.initiate_sent = true;

        let oracle = &self.ctx.oracle;
        let initiated = match oracle
            .trust_anchor()
            .initiate_recovery(oracle.account(), lost_factor, &self.idempotency_key)
            .await
        {
            Ok(initiated) => initiated,
            Err(e) => {
                log::warn!("[{}] Failed to initiate recovery: {}", oracle.account(), e);
                // Idempotent replays of a landed request succeed; a refusal
                // means nothing exists under our key
                if matches!(e, TrustAnchorError::Rejected(_)) {
                    self.initiate_sent = false;
                }
                return self.transition(OwnRecoveryState::InitiationFailed {
                    lost_factor,
                    cause: FailureCause::from(&e),
                });
            }
        };

        let own = OwnRecovery {
            recovery_id: initiated.recovery_id.clone(),
            lost_factor,
            delay_period: initiated.delay_period,
            idempotency_key: self.idempotency_key.clone(),
            authorization: None,
        };
        // Unrecorded, our own recovery would read back as someone else's
        if let Err(e) = oracle.record_initiated(own) {
            return self.transition(OwnRecoveryState::InitiationFailed {
                lost_factor,
                cause: FailureCause::from(&e),
            });
        }

        let next = self.delay_state(initiated.recovery_id, initiated.delay_period);
        let next = self.transition(next);
        self.ctx.refresh_after("initiate").await;
        next
    }

    fn delay_state(&self, recovery_id: RecoveryId, delay_period: DelayPeriod) -> OwnRecoveryState {
        if delay_period.is_elapsed(self.ctx.clock.now()) {
            OwnRecoveryState::ReadyToComplete {
                lost_factor: self.lost_factor,
                recovery_id,
                delay_period,
            }
        } else {
            OwnRecoveryState::WaitingForDelayPeriod {
                lost_factor: self.lost_factor,
                recovery_id,
                delay_period,
            }
        }
    }

    /// Re-read the clock; moves to `ReadyToComplete` once nothing remains.
    pub fn tick(&mut self) -> OwnRecoveryState {
        match self.state.get() {
            OwnRecoveryState::WaitingForDelayPeriod {
                recovery_id,
                delay_period,
                ..
            } if delay_period.is_elapsed(self.ctx.clock.now()) => {
                let next = self.delay_state(recovery_id, delay_period);
                self.transition(next)
            }
            state => state,
        }
    }

    /// Authorize at the trust anchor, then rotate key material.
    pub async fn complete(&mut self) -> OwnRecoveryState {
        let state = self.state.get();
        let OwnRecoveryState::ReadyToComplete {
            recovery_id,
            delay_period,
            ..
        } = state.clone()
        else {
            invariant_violation(MACHINE, "complete", &state);
            return state;
        };

        if !delay_period.is_elapsed(self.ctx.clock.now()) {
            log::warn!(
                "Clock is before the end of the delay ({}); waiting again",
                delay_period.end()
            );
            return self.transition(OwnRecoveryState::WaitingForDelayPeriod {
                lost_factor: self.lost_factor,
                recovery_id,
                delay_period,
            });
        }
        self.run_completion(recovery_id, delay_period).await
    }

    async fn run_completion(
        &mut self,
        recovery_id: RecoveryId,
        delay_period: DelayPeriod,
    ) -> OwnRecoveryState {
        let lost_factor = self.lost_factor;
        self.transition(OwnRecoveryState::Completing {
            lost_factor,
            recovery_id: recovery_id.clone(),
            delay_period,
        });
        let failed = |cause: FailureCause| OwnRecoveryState::CompletingFailed {
            lost_factor,
            recovery_id: recovery_id.clone(),
            delay_period,
            cause,
        };

        let authorization = match self.authorization.clone() {
            Some(authorization) => authorization,
            None => {
                let oracle = &self.ctx.oracle;
                match oracle
                    .trust_anchor()
                    .authorize_completion(oracle.account(), &recovery_id, &self.idempotency_key)
                    .await
                {
                    Ok(authorization) => {
                        if let Err(e) = oracle.record_authorization(&authorization) {
                            // Same key on restart gets the same authorization back
                            log::warn!("Authorization for {} not persisted: {}", recovery_id, e);
                        }
                        self.authorization = Some(authorization.clone());
                        authorization
                    }
                    Err(e) => {
                        log::warn!("Authorization for {} failed: {}", recovery_id, e);
                        return self.transition(failed(FailureCause::from(&e)));
                    }
                }
            }
        };

        if !self.rotated {
            if let Err(e) = self.ctx.rotator.rotate(lost_factor, &authorization).await {
                log::warn!("Key rotation for {} failed: {}", recovery_id, e);
                let kind = match e {
                    RotationError::Refused(_) => FailureKind::Terminal,
                    _ => FailureKind::Transient,
                };
                return self.transition(failed(FailureCause::new(kind, e.to_string())));
            }
            self.rotated = true;
        }

        if let Err(e) = self.ctx.oracle.record_completed(&recovery_id) {
            return self.transition(failed(FailureCause::partial(&e)));
        }

        let done = self.transition(OwnRecoveryState::Done { lost_factor });
        self.ctx.refresh_after("completion").await;
        done
    }

    /// Cancel this recovery at the trust anchor and drop the local record.
    pub async fn cancel(&mut self) -> OwnRecoveryState {
        let state = self.state.get();
        match &state {
            OwnRecoveryState::Initiating { lost_factor } if !self.initiate_sent => {
                return self.transition(OwnRecoveryState::Canceled {
                    lost_factor: *lost_factor,
                });
            }
            OwnRecoveryState::Initiating { .. }
            | OwnRecoveryState::WaitingForDelayPeriod { .. }
            | OwnRecoveryState::ReadyToComplete { .. } => {}
            _ => {
                invariant_violation(MACHINE, "cancel", &state);
                return state;
            }
        }
        self.cancel = Some(TwoPhaseCancel::cancel_then_clear(None));
        self.run_cancel(state).await
    }

    async fn run_cancel(&mut self, previous: OwnRecoveryState) -> OwnRecoveryState {
        self.transition(OwnRecoveryState::Canceling {
            previous: Box::new(previous.clone()),
        });
        let mut op = self
            .cancel
            .take()
            .unwrap_or_else(|| TwoPhaseCancel::cancel_then_clear(None));

        match op.run(&self.ctx.oracle).await {
            TwoPhaseOutcome::Completed | TwoPhaseOutcome::AlreadyResolved => {
                let canceled = self.transition(OwnRecoveryState::Canceled {
                    lost_factor: self.lost_factor,
                });
                self.ctx.refresh_after("cancel").await;
                canceled
            }
            TwoPhaseOutcome::ProofExpired => {
                self.transition(OwnRecoveryState::CancelingFailed {
                    previous: Box::new(previous),
                    cause: FailureCause::from(&TrustAnchorError::ProofExpired),
                })
            }
            TwoPhaseOutcome::RemoteFailed(cause) | TwoPhaseOutcome::LocalFailed(cause) => {
                self.cancel = Some(op);
                self.transition(OwnRecoveryState::CancelingFailed {
                    previous: Box::new(previous),
                    cause,
                })
            }
        }
    }

    /// Try the failed step again, keeping everything already collected.
    pub async fn retry(&mut self) -> OwnRecoveryState {
        match self.state.get() {
            OwnRecoveryState::InitiationFailed { lost_factor, .. } => {
                self.transition(OwnRecoveryState::Initiating { lost_factor });
                self.send_initiate().await
            }
            OwnRecoveryState::CompletingFailed {
                recovery_id,
                delay_period,
                ..
            } => self.run_completion(recovery_id, delay_period).await,
            OwnRecoveryState::CancelingFailed { previous, .. } => self.run_cancel(*previous).await,
            state => {
                invariant_violation(MACHINE, "retry", &state);
                state
            }
        }
    }

    /// Give up on the failed step and return to where it started.
    pub fn rollback(&mut self) -> OwnRecoveryState {
        match self.state.get() {
            OwnRecoveryState::InitiationFailed { lost_factor, .. } => {
                self.transition(OwnRecoveryState::Initiating { lost_factor })
            }
            OwnRecoveryState::CompletingFailed {
                lost_factor,
                recovery_id,
                delay_period,
                ..
            } => self.transition(OwnRecoveryState::ReadyToComplete {
                lost_factor,
                recovery_id,
                delay_period,
            }),
            OwnRecoveryState::CancelingFailed { previous, .. } => {
                self.cancel = None;
                self.transition(*previous)
            }
            state => {
                invariant_violation(MACHINE, "rollback", &state);
                state
            }
        }
    }

    fn transition(&self, next: OwnRecoveryState) -> OwnRecoveryState {
        self.state.set(next.clone());
        next
    }
}
