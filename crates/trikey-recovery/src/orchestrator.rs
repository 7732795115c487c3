//! Picks the one machine that owns the account right now.
//!
//! Re-evaluated on every oracle emission: a conflict can resolve on its own,
//! and an adversarial recovery can complete while the user looks away.

use crate::conflict::ConflictMachine;
use crate::no_longer::NoLongerRecoveringMachine;
use crate::own::{OwnRecoveryMachine, OwnRecoveryState};
use crate::RecoveryContext;
use futures::StreamExt;
use thiserror::Error;
use trikey_core::{DelayPeriod, PhysicalFactor, Recovery};
use trikey_watch::Observation;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Cannot start a recovery while {0} is active")]
    Busy(&'static str),
}

/// Which machine a recovery view calls for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Idle,
    OwnRecovery {
        lost_factor: PhysicalFactor,
        delay_period: DelayPeriod,
    },
    Conflict {
        lost_factor: PhysicalFactor,
    },
    NoLongerRecovering {
        lost_factor: PhysicalFactor,
    },
    /// Someone else's recovery completed: our key for `lost_factor` is gone
    RecoveryLost {
        lost_factor: PhysicalFactor,
    },
}

pub fn route(recovery: &Recovery) -> Route {
    match recovery {
        Recovery::NoActiveRecovery => Route::Idle,
        Recovery::StillRecovering {
            lost_factor,
            delay_period,
        } => Route::OwnRecovery {
            lost_factor: *lost_factor,
            delay_period: *delay_period,
        },
        Recovery::SomeoneElseIsRecovering { lost_factor } => Route::Conflict {
            lost_factor: *lost_factor,
        },
        Recovery::NoLongerRecovering { lost_factor } => Route::NoLongerRecovering {
            lost_factor: *lost_factor,
        },
        Recovery::ConflictingRecoveryCompleted { lost_factor } => Route::RecoveryLost {
            lost_factor: *lost_factor,
        },
    }
}

/// The single machine in charge of the account
pub enum ActiveMachine {
    Idle,
    OwnRecovery(OwnRecoveryMachine),
    Conflict(ConflictMachine),
    NoLongerRecovering(NoLongerRecoveringMachine),
    RecoveryLost { lost_factor: PhysicalFactor },
}

impl ActiveMachine {
    pub fn kind(&self) -> &'static str {
        match self {
            ActiveMachine::Idle => "idle",
            ActiveMachine::OwnRecovery(_) => "own recovery",
            ActiveMachine::Conflict(_) => "conflict",
            ActiveMachine::NoLongerRecovering(_) => "no longer recovering",
            ActiveMachine::RecoveryLost { .. } => "recovery lost",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ActiveMachine::Idle)
    }
}

impl std::fmt::Debug for ActiveMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActiveMachine::Idle => write!(f, "Idle"),
            ActiveMachine::OwnRecovery(m) => write!(f, "OwnRecovery({:?})", m.state()),
            ActiveMachine::Conflict(m) => write!(f, "Conflict({:?})", m.state()),
            ActiveMachine::NoLongerRecovering(m) => {
                write!(f, "NoLongerRecovering({:?})", m.state())
            }
            ActiveMachine::RecoveryLost { lost_factor } => {
                write!(f, "RecoveryLost({})", lost_factor)
            }
        }
    }
}

pub struct RecoveryOrchestrator {
    ctx: RecoveryContext,
    active: ActiveMachine,
}

impl RecoveryOrchestrator {
    pub fn new(ctx: RecoveryContext) -> Self {
        Self {
            ctx,
            active: ActiveMachine::Idle,
        }
    }

    pub fn active(&self) -> &ActiveMachine {
        &self.active
    }

    pub fn own_recovery(&mut self) -> Option<&mut OwnRecoveryMachine> {
        match &mut self.active {
            ActiveMachine::OwnRecovery(m) => Some(m),
            _ => None,
        }
    }

    pub fn conflict(&mut self) -> Option<&mut ConflictMachine> {
        match &mut self.active {
            ActiveMachine::Conflict(m) => Some(m),
            _ => None,
        }
    }

    pub fn no_longer_recovering(&mut self) -> Option<&mut NoLongerRecoveringMachine> {
        match &mut self.active {
            ActiveMachine::NoLongerRecovering(m) => Some(m),
            _ => None,
        }
    }

    /// Start recovering `lost_factor`. Only legal with nothing else going on.
    pub async fn start_recovery(
        &mut self,
        lost_factor: PhysicalFactor,
    ) -> Result<OwnRecoveryState, OrchestratorError> {
        if !self.active.is_idle() {
            return Err(OrchestratorError::Busy(self.active.kind()));
        }
        let mut machine = OwnRecoveryMachine::begin(self.ctx.clone(), lost_factor);
        let state = machine.initiate().await;
        self.active = ActiveMachine::OwnRecovery(machine);
        Ok(state)
    }

    /// Re-route on an oracle emission.
    ///
    /// A failed read keeps the current machine; the next read decides.
    pub fn apply(&mut self, observation: &Observation) -> &ActiveMachine {
        let recovery = match observation {
            Ok(recovery) => recovery,
            Err(e) => {
                log::warn!(
                    "[{}] Keeping {} after failed status read: {}",
                    self.ctx.oracle.account(),
                    self.active.kind(),
                    e
                );
                return &self.active;
            }
        };

        let route = route(recovery);
        if self.keeps(&route) {
            return &self.active;
        }

        if let ActiveMachine::Conflict(machine) = &self.active {
            if !machine.state().is_terminal() {
                log::warn!(
                    "[{}] Conflicting recovery resolved before we finished contesting it",
                    self.ctx.oracle.account()
                );
            }
        }
        let next = self.machine_for(route);
        log::info!(
            "[{}] {} -> {}",
            self.ctx.oracle.account(),
            self.active.kind(),
            next.kind()
        );
        self.active = next;
        &self.active
    }

    /// Read the oracle now and re-route.
    pub async fn sync(&mut self) -> &ActiveMachine {
        let observation = self.ctx.oracle.refresh().await;
        self.apply(&observation);
        self.reconcile_initiation(&observation).await;
        &self.active
    }

    /// Follow the oracle until its stream ends.
    pub async fn run(&mut self) {
        let mut observations = Box::pin(self.ctx.oracle.observe());
        while let Some(observation) = observations.next().await {
            self.apply(&observation);
            self.reconcile_initiation(&observation).await;
        }
    }

    /// Settle whose recovery the trust anchor is showing when our own
    /// initiate may have landed without being recorded.
    ///
    /// Replays the initiate under the same idempotency key: the trust anchor
    /// hands back our recovery if it is ours and refuses otherwise, in which
    /// case the conflict takes over.
    async fn reconcile_initiation(&mut self, observation: &Observation) {
        let Ok(Recovery::SomeoneElseIsRecovering { lost_factor }) = observation else {
            return;
        };
        let ActiveMachine::OwnRecovery(machine) = &mut self.active else {
            return;
        };
        if !machine.may_have_landed() || machine.lost_factor() != *lost_factor {
            return;
        }

        log::info!(
            "[{}] Pending {} recovery may be our unrecorded one; replaying initiate",
            self.ctx.oracle.account(),
            lost_factor
        );
        let state = match machine.state() {
            OwnRecoveryState::InitiationFailed { .. } => machine.retry().await,
            _ => machine.initiate().await,
        };
        if machine.may_have_landed() {
            // Still unknown; keep the machine until a read can tell
            return;
        }
        if matches!(state, OwnRecoveryState::InitiationFailed { .. }) {
            log::warn!(
                "[{}] Pending {} recovery is not ours",
                self.ctx.oracle.account(),
                lost_factor
            );
            self.apply(observation);
        }
    }

    fn keeps(&self, route: &Route) -> bool {
        match (&self.active, route) {
            (ActiveMachine::Idle, Route::Idle) => true,
            (
                ActiveMachine::OwnRecovery(m),
                Route::OwnRecovery {
                    lost_factor,
                    delay_period,
                },
            ) => {
                m.lost_factor() == *lost_factor
                    && !m.state().is_terminal()
                    // Delay bounds are the trust anchor's to set
                    && !matches!(m.delay_period(), Some(d) if d != *delay_period)
            }
            // Not yet visible at the trust anchor
            (ActiveMachine::OwnRecovery(m), Route::Idle) => m.state().is_pre_initiation(),
            // Possibly ours but unrecorded; settled by reconcile_initiation
            (ActiveMachine::OwnRecovery(m), Route::Conflict { lost_factor }) => {
                m.lost_factor() == *lost_factor && m.may_have_landed()
            }
            // Our own cancel went through remotely; the machine finishes the local part
            (ActiveMachine::OwnRecovery(m), Route::NoLongerRecovering { lost_factor }) => {
                m.lost_factor() == *lost_factor
                    && matches!(
                        m.state(),
                        OwnRecoveryState::Canceling { .. } | OwnRecoveryState::CancelingFailed { .. }
                    )
            }
            (ActiveMachine::Conflict(m), Route::Conflict { lost_factor }) => {
                m.lost_factor() == *lost_factor && !m.state().is_terminal()
            }
            (ActiveMachine::NoLongerRecovering(m), Route::NoLongerRecovering { lost_factor }) => {
                m.lost_factor() == *lost_factor && !m.state().is_terminal()
            }
            (
                ActiveMachine::RecoveryLost { lost_factor: current },
                Route::RecoveryLost { lost_factor },
            ) => current == lost_factor,
            _ => false,
        }
    }

    fn machine_for(&self, route: Route) -> ActiveMachine {
        let ctx = self.ctx.clone();
        match route {
            Route::Idle => ActiveMachine::Idle,
            Route::OwnRecovery {
                lost_factor,
                delay_period,
            } => match self.ctx.oracle.own_recovery() {
                Ok(Some(mut own)) if own.lost_factor == lost_factor => {
                    if own.delay_period != delay_period {
                        log::warn!(
                            "[{}] Trust anchor moved the delay of recovery {} to end at {}",
                            self.ctx.oracle.account(),
                            own.recovery_id,
                            delay_period.end()
                        );
                        own.delay_period = delay_period;
                    }
                    ActiveMachine::OwnRecovery(OwnRecoveryMachine::resume(ctx, own))
                }
                Ok(_) => {
                    log::error!(
                        "[{}] Own recovery reported but no matching local record",
                        self.ctx.oracle.account()
                    );
                    ActiveMachine::Idle
                }
                Err(e) => {
                    log::error!(
                        "[{}] Failed to read own recovery record: {}",
                        self.ctx.oracle.account(),
                        e
                    );
                    ActiveMachine::Idle
                }
            },
            Route::Conflict { lost_factor } => {
                ActiveMachine::Conflict(ConflictMachine::new(ctx, lost_factor))
            }
            Route::NoLongerRecovering { lost_factor } => {
                ActiveMachine::NoLongerRecovering(NoLongerRecoveringMachine::new(ctx, lost_factor))
            }
            Route::RecoveryLost { lost_factor } => {
                log::error!(
                    "[{}] A conflicting recovery completed; the {} key was replaced by someone else",
                    self.ctx.oracle.account(),
                    lost_factor
                );
                ActiveMachine::RecoveryLost { lost_factor }
            }
        }
    }
}
