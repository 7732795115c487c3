//! Our own recovery was canceled from elsewhere; the user acknowledges it.

use crate::cell::StateCell;
use crate::failure::{invariant_violation, FailureCause};
use crate::two_phase::{TwoPhaseCancel, TwoPhaseOutcome};
use crate::RecoveryContext;
use tokio::sync::watch;
use trikey_core::PhysicalFactor;

const MACHINE: &str = "no-longer-recovering";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoLongerRecoveringState {
    ShowingNoLongerRecovering { lost_factor: PhysicalFactor },
    ClearingLocalRecovery { lost_factor: PhysicalFactor },
    ClearingFailed {
        lost_factor: PhysicalFactor,
        cause: FailureCause,
    },
    Done { lost_factor: PhysicalFactor },
}

impl NoLongerRecoveringState {
    pub fn lost_factor(&self) -> PhysicalFactor {
        match self {
            NoLongerRecoveringState::ShowingNoLongerRecovering { lost_factor }
            | NoLongerRecoveringState::ClearingLocalRecovery { lost_factor }
            | NoLongerRecoveringState::ClearingFailed { lost_factor, .. }
            | NoLongerRecoveringState::Done { lost_factor } => *lost_factor,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NoLongerRecoveringState::Done { .. })
    }
}

pub struct NoLongerRecoveringMachine {
    ctx: RecoveryContext,
    lost_factor: PhysicalFactor,
    state: StateCell<NoLongerRecoveringState>,
}

impl NoLongerRecoveringMachine {
    pub fn new(ctx: RecoveryContext, lost_factor: PhysicalFactor) -> Self {
        Self {
            ctx,
            lost_factor,
            state: StateCell::new(
                MACHINE,
                NoLongerRecoveringState::ShowingNoLongerRecovering { lost_factor },
            ),
        }
    }

    pub fn state(&self) -> NoLongerRecoveringState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<NoLongerRecoveringState> {
        self.state.subscribe()
    }

    pub fn lost_factor(&self) -> PhysicalFactor {
        self.lost_factor
    }

    pub async fn on_acknowledge(&mut self) -> NoLongerRecoveringState {
        let state = self.state.get();
        if !matches!(
            state,
            NoLongerRecoveringState::ShowingNoLongerRecovering { .. }
        ) {
            invariant_violation(MACHINE, "on_acknowledge", &state);
            return state;
        }
        self.clear().await
    }

    pub async fn retry(&mut self) -> NoLongerRecoveringState {
        let state = self.state.get();
        if !matches!(state, NoLongerRecoveringState::ClearingFailed { .. }) {
            invariant_violation(MACHINE, "retry", &state);
            return state;
        }
        self.clear().await
    }

    pub fn rollback(&mut self) -> NoLongerRecoveringState {
        let state = self.state.get();
        if !matches!(state, NoLongerRecoveringState::ClearingFailed { .. }) {
            invariant_violation(MACHINE, "rollback", &state);
            return state;
        }
        self.transition(NoLongerRecoveringState::ShowingNoLongerRecovering {
            lost_factor: self.lost_factor,
        })
    }

    async fn clear(&mut self) -> NoLongerRecoveringState {
        let lost_factor = self.lost_factor;
        self.transition(NoLongerRecoveringState::ClearingLocalRecovery { lost_factor });

        match TwoPhaseCancel::acknowledge().run(&self.ctx.oracle).await {
            TwoPhaseOutcome::Completed | TwoPhaseOutcome::AlreadyResolved => {
                let done = self.transition(NoLongerRecoveringState::Done { lost_factor });
                self.ctx.refresh_after("acknowledge").await;
                done
            }
            TwoPhaseOutcome::LocalFailed(cause) | TwoPhaseOutcome::RemoteFailed(cause) => {
                log::warn!("Failed to clear canceled recovery: {}", cause);
                self.transition(NoLongerRecoveringState::ClearingFailed { lost_factor, cause })
            }
            // No remote phase to expire
            TwoPhaseOutcome::ProofExpired => self.transition(NoLongerRecoveringState::ClearingFailed {
                lost_factor,
                cause: FailureCause::from(&trikey_watch::TrustAnchorError::ProofExpired),
            }),
        }
    }

    fn transition(&self, next: NoLongerRecoveringState) -> NoLongerRecoveringState {
        self.state.set(next.clone());
        next
    }
}
