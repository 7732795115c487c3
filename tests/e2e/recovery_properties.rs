//! Protocol-wide properties of the recovery machines.
//!
//! 1. Exactly one machine is active, and it is the one the current view calls for
//! 2. Network calls happen in protocol order (challenge, proof, cancel;
//!    initiate, authorize, rotate)
//! 3. Retrying a failed step never repeats a hardware tap or mints a new key
//! 4. Rollback from a failed state restores the state before the attempt
//! 5. Remaining delay time never goes up
//!
//! Run with: cargo test --test recovery_properties

use assert_matches::assert_matches;
use proptest::prelude::*;
use std::time::Duration;
use trikey_core::{PhysicalFactor, Recovery};
use trikey_recovery::test_utils::{AnchorCall, Harness, DEFAULT_DELAY};
use trikey_recovery::{
    route, ActiveMachine, ConflictMachine, ConflictState, NoLongerRecoveringMachine,
    NoLongerRecoveringState, OwnRecoveryMachine, OwnRecoveryState, RecoveryOrchestrator, Route,
};
use trikey_watch::{ServerRecovery, TrustAnchorError};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// 1. One machine, matching the view
// ============================================================================

#[derive(Debug, Clone)]
enum Event {
    /// User starts recovering a factor on this device
    StartRecovery(PhysicalFactor),
    /// Another party starts a recovery at the trust anchor
    ForeignRecovery(PhysicalFactor),
    /// Another device cancels whatever is pending
    CanceledElsewhere,
    /// The pending recovery's initiator completes it
    CompletedElsewhere,
    AdvanceClock(u64),
    FailNextFetch,
    FailNextCancel,
    /// User presses the primary action of the active machine
    Act,
    Retry,
    Rollback,
    Sync,
}

fn factor() -> impl Strategy<Value = PhysicalFactor> {
    prop_oneof![Just(PhysicalFactor::App), Just(PhysicalFactor::Hardware)]
}

fn event() -> impl Strategy<Value = Event> {
    prop_oneof![
        factor().prop_map(Event::StartRecovery),
        factor().prop_map(Event::ForeignRecovery),
        Just(Event::CanceledElsewhere),
        Just(Event::CompletedElsewhere),
        (0u64..(10 * 24 * 3600)).prop_map(Event::AdvanceClock),
        Just(Event::FailNextFetch),
        Just(Event::FailNextCancel),
        Just(Event::Act),
        Just(Event::Act),
        Just(Event::Retry),
        Just(Event::Rollback),
        Just(Event::Sync),
        Just(Event::Sync),
    ]
}

/// Whether `active` is the machine `route` calls for.
///
/// An own machine survives views that do not name it yet: an idle view
/// before the initiate request lands, a same-factor conflict while an
/// unrecorded initiate is still unsettled, and a "no longer recovering" view
/// while it finishes its own cancel locally.
fn serves(active: &ActiveMachine, route: &Route) -> bool {
    match (active, route) {
        (ActiveMachine::Idle, Route::Idle) => true,
        (ActiveMachine::OwnRecovery(m), Route::Idle) => m.state().is_pre_initiation(),
        (ActiveMachine::OwnRecovery(m), Route::OwnRecovery { lost_factor, .. }) => {
            m.lost_factor() == *lost_factor
        }
        (ActiveMachine::OwnRecovery(m), Route::NoLongerRecovering { lost_factor }) => {
            m.lost_factor() == *lost_factor
                && matches!(
                    m.state(),
                    OwnRecoveryState::Canceling { .. } | OwnRecoveryState::CancelingFailed { .. }
                )
        }
        (ActiveMachine::OwnRecovery(m), Route::Conflict { lost_factor }) => {
            m.lost_factor() == *lost_factor && m.may_have_landed()
        }
        (ActiveMachine::Conflict(m), Route::Conflict { lost_factor }) => {
            m.lost_factor() == *lost_factor
        }
        (ActiveMachine::NoLongerRecovering(m), Route::NoLongerRecovering { lost_factor }) => {
            m.lost_factor() == *lost_factor
        }
        (
            ActiveMachine::RecoveryLost { lost_factor: active },
            Route::RecoveryLost { lost_factor },
        ) => active == lost_factor,
        _ => false,
    }
}

async fn act_own(machine: &mut OwnRecoveryMachine) {
    match machine.tick() {
        OwnRecoveryState::Initiating { .. } => {
            machine.initiate().await;
        }
        OwnRecoveryState::ReadyToComplete { .. } => {
            machine.complete().await;
        }
        OwnRecoveryState::WaitingForDelayPeriod { .. } => {
            machine.cancel().await;
        }
        _ => {}
    }
}

async fn act_conflict(machine: &mut ConflictMachine) {
    match machine.state() {
        ConflictState::ShowingConflict { .. } => {
            let _ = machine.on_cancel_recovery_conflict().await;
        }
        ConflictState::AwaitingHardwareProofOfPossession { .. } => {
            let _ = machine.request_proof().await;
        }
        _ => {}
    }
}

async fn act_no_longer(machine: &mut NoLongerRecoveringMachine) {
    if let NoLongerRecoveringState::ShowingNoLongerRecovering { .. } = machine.state() {
        machine.on_acknowledge().await;
    }
}

fn is_own_failure(state: &OwnRecoveryState) -> bool {
    matches!(
        state,
        OwnRecoveryState::InitiationFailed { .. }
            | OwnRecoveryState::CompletingFailed { .. }
            | OwnRecoveryState::CancelingFailed { .. }
    )
}

async fn retry(orchestrator: &mut RecoveryOrchestrator) {
    if let Some(m) = orchestrator.own_recovery() {
        if is_own_failure(&m.state()) {
            m.retry().await;
        }
    } else if let Some(m) = orchestrator.conflict() {
        if matches!(m.state(), ConflictState::CancelingFailed { .. }) {
            m.retry().await;
        }
    } else if let Some(m) = orchestrator.no_longer_recovering() {
        if matches!(m.state(), NoLongerRecoveringState::ClearingFailed { .. }) {
            m.retry().await;
        }
    }
}

/// Back out of whatever failed step or hardware prompt is showing
fn rollback(orchestrator: &mut RecoveryOrchestrator) {
    if let Some(m) = orchestrator.own_recovery() {
        if is_own_failure(&m.state()) {
            m.rollback();
        }
    } else if let Some(m) = orchestrator.conflict() {
        match m.state() {
            ConflictState::AwaitingHardwareProofOfPossession { .. } => {
                m.on_cancel();
            }
            ConflictState::CancelingFailed { .. } => {
                m.rollback();
            }
            _ => {}
        }
    } else if let Some(m) = orchestrator.no_longer_recovering() {
        if matches!(m.state(), NoLongerRecoveringState::ClearingFailed { .. }) {
            m.rollback();
        }
    }
}

async fn run_events(events: Vec<Event>) -> Result<(), TestCaseError> {
    let harness = Harness::new();
    let mut orchestrator = RecoveryOrchestrator::new(harness.ctx.clone());

    for event in events {
        match event {
            Event::StartRecovery(lost_factor) => {
                let _ = orchestrator.start_recovery(lost_factor).await;
            }
            Event::ForeignRecovery(lost_factor) => {
                harness.anchor.start_foreign_recovery(lost_factor);
            }
            Event::CanceledElsewhere => harness.anchor.set_status(ServerRecovery::NoRecovery),
            Event::CompletedElsewhere => harness.anchor.complete_pending(),
            Event::AdvanceClock(secs) => harness.clock.advance(Duration::from_secs(secs)),
            Event::FailNextFetch => harness
                .anchor
                .fail_next_fetch(TrustAnchorError::Transient("offline".into())),
            Event::FailNextCancel => harness
                .anchor
                .fail_next_cancel(TrustAnchorError::Transient("offline".into())),
            Event::Act => {
                if let Some(m) = orchestrator.own_recovery() {
                    act_own(m).await;
                } else if let Some(m) = orchestrator.conflict() {
                    act_conflict(m).await;
                } else if let Some(m) = orchestrator.no_longer_recovering() {
                    act_no_longer(m).await;
                }
            }
            Event::Retry => retry(&mut orchestrator).await,
            Event::Rollback => rollback(&mut orchestrator),
            Event::Sync => {
                let kind = orchestrator.sync().await.kind();
                if let Some(Ok(recovery)) = harness.oracle.current() {
                    let expected = route(&recovery);
                    prop_assert!(
                        serves(orchestrator.active(), &expected),
                        "{} active for view {:?}",
                        kind,
                        recovery
                    );
                }
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn active_machine_matches_view(events in prop::collection::vec(event(), 1..40)) {
        runtime().block_on(run_events(events))?;
    }
}

#[tokio::test]
async fn failed_read_keeps_active_machine() {
    let harness = Harness::new();
    harness.anchor.start_foreign_recovery(PhysicalFactor::App);
    let mut orchestrator = RecoveryOrchestrator::new(harness.ctx.clone());
    assert_matches!(orchestrator.sync().await, ActiveMachine::Conflict(_));

    harness
        .anchor
        .fail_next_fetch(TrustAnchorError::Transient("offline".into()));
    assert_matches!(orchestrator.sync().await, ActiveMachine::Conflict(_));
    assert_matches!(harness.oracle.current(), Some(Err(_)));
}

// ============================================================================
// 2. Protocol order
// ============================================================================

fn non_fetch_calls(harness: &Harness) -> Vec<AnchorCall> {
    harness
        .anchor
        .calls()
        .into_iter()
        .filter(|call| !matches!(call, AnchorCall::Fetch))
        .collect()
}

#[tokio::test]
async fn hardware_conflict_calls_in_order() {
    let harness = Harness::new();
    harness.anchor.start_foreign_recovery(PhysicalFactor::Hardware);
    let mut machine = ConflictMachine::new(harness.ctx.clone(), PhysicalFactor::Hardware);

    machine.on_cancel_recovery_conflict().await.unwrap();
    assert_eq!(harness.hardware.session_count(), 0);
    assert_matches!(
        machine.request_proof().await,
        Ok(ConflictState::Done { .. })
    );

    let calls = non_fetch_calls(&harness);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], AnchorCall::Challenge);
    let AnchorCall::Cancel(request) = &calls[1] else {
        panic!("expected cancel, got {:?}", calls[1]);
    };
    let proof = request.proof.as_ref().unwrap();
    assert_eq!(harness.hardware.challenges(), vec![proof.challenge]);
}

#[tokio::test]
async fn own_recovery_calls_in_order() {
    let harness = Harness::new();
    let mut machine = OwnRecoveryMachine::begin(harness.ctx.clone(), PhysicalFactor::App);
    machine.initiate().await;

    // Nothing past initiate before the delay ends
    harness.clock.advance(DEFAULT_DELAY / 2);
    assert_matches!(machine.tick(), OwnRecoveryState::WaitingForDelayPeriod { .. });
    assert_eq!(harness.anchor.authorize_count(), 0);

    harness.clock.advance(DEFAULT_DELAY / 2);
    assert_matches!(machine.tick(), OwnRecoveryState::ReadyToComplete { .. });
    assert_matches!(machine.complete().await, OwnRecoveryState::Done { .. });

    let calls = non_fetch_calls(&harness);
    assert_eq!(calls.len(), 2);
    let AnchorCall::Initiate {
        idempotency_key: initiate_key,
        ..
    } = &calls[0]
    else {
        panic!("expected initiate, got {:?}", calls[0]);
    };
    let AnchorCall::Authorize {
        idempotency_key: authorize_key,
        recovery_id,
    } = &calls[1]
    else {
        panic!("expected authorize, got {:?}", calls[1]);
    };
    assert_eq!(initiate_key, authorize_key);

    let rotations = harness.rotator.rotations();
    assert_eq!(rotations.len(), 1);
    assert_eq!(&rotations[0].recovery_id, recovery_id);
}

// ============================================================================
// 3. Retries reuse what was collected
// ============================================================================

#[tokio::test]
async fn repeated_cancel_retries_send_identical_request() {
    let harness = Harness::new();
    harness.anchor.start_foreign_recovery(PhysicalFactor::Hardware);
    let mut machine = ConflictMachine::new(harness.ctx.clone(), PhysicalFactor::Hardware);

    machine.on_cancel_recovery_conflict().await.unwrap();
    for _ in 0..3 {
        harness
            .anchor
            .fail_next_cancel(TrustAnchorError::Transient("busy".into()));
    }
    assert_matches!(
        machine.request_proof().await,
        Ok(ConflictState::CancelingFailed { .. })
    );
    assert_matches!(machine.retry().await, ConflictState::CancelingFailed { .. });
    assert_matches!(machine.retry().await, ConflictState::CancelingFailed { .. });
    assert_matches!(machine.retry().await, ConflictState::Done { .. });

    let requests = harness.anchor.cancel_requests();
    assert_eq!(requests.len(), 4);
    assert!(requests.iter().all(|r| *r == requests[0]));
    assert_eq!(harness.hardware.session_count(), 1);
    assert_eq!(harness.anchor.challenge_count(), 1);
}

#[tokio::test]
async fn initiate_retry_reuses_key() {
    let harness = Harness::new();
    let mut machine = OwnRecoveryMachine::begin(harness.ctx.clone(), PhysicalFactor::Hardware);

    harness
        .anchor
        .fail_next_initiate(TrustAnchorError::Transient("timeout".into()));
    assert_matches!(
        machine.initiate().await,
        OwnRecoveryState::InitiationFailed { .. }
    );
    assert_matches!(
        machine.retry().await,
        OwnRecoveryState::WaitingForDelayPeriod { .. }
    );

    let keys: Vec<_> = harness
        .anchor
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            AnchorCall::Initiate {
                idempotency_key, ..
            } => Some(idempotency_key),
            _ => None,
        })
        .collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], keys[1]);
}

#[tokio::test]
async fn lost_authorize_response_is_not_authorized_twice() {
    let harness = Harness::new();
    let mut machine = OwnRecoveryMachine::begin(harness.ctx.clone(), PhysicalFactor::App);
    machine.initiate().await;
    harness.clock.advance(DEFAULT_DELAY);
    machine.tick();

    harness.anchor.lose_next_authorize_response();
    assert_matches!(
        machine.complete().await,
        OwnRecoveryState::CompletingFailed { .. }
    );
    assert_matches!(machine.retry().await, OwnRecoveryState::Done { .. });

    assert_eq!(harness.anchor.authorize_count(), 2);
    assert_eq!(harness.rotator.rotation_count(), 1);
    assert_matches!(harness.oracle.current(), Some(Ok(Recovery::NoActiveRecovery)));
}

// ============================================================================
// 4. Rollback restores the prior state
// ============================================================================

#[tokio::test]
async fn rollback_from_initiation_failed() {
    let harness = Harness::new();
    let mut machine = OwnRecoveryMachine::begin(harness.ctx.clone(), PhysicalFactor::App);
    let before = machine.state();

    harness
        .anchor
        .fail_next_initiate(TrustAnchorError::Transient("timeout".into()));
    machine.initiate().await;
    assert_eq!(machine.rollback(), before);
}

#[tokio::test]
async fn rollback_from_completing_failed() {
    let harness = Harness::new();
    let mut machine = OwnRecoveryMachine::begin(harness.ctx.clone(), PhysicalFactor::App);
    machine.initiate().await;
    harness.clock.advance(DEFAULT_DELAY);
    let before = machine.tick();
    assert_matches!(before, OwnRecoveryState::ReadyToComplete { .. });

    harness
        .anchor
        .fail_next_authorize(TrustAnchorError::Transient("timeout".into()));
    assert_matches!(
        machine.complete().await,
        OwnRecoveryState::CompletingFailed { .. }
    );
    assert_eq!(machine.rollback(), before);
}

#[tokio::test]
async fn rollback_from_own_canceling_failed() {
    let harness = Harness::new();
    let mut machine = OwnRecoveryMachine::begin(harness.ctx.clone(), PhysicalFactor::Hardware);
    let before = machine.initiate().await;

    harness
        .anchor
        .fail_next_cancel(TrustAnchorError::Transient("timeout".into()));
    assert_matches!(
        machine.cancel().await,
        OwnRecoveryState::CancelingFailed { .. }
    );
    assert_eq!(machine.rollback(), before);
    assert_matches!(harness.anchor.status(), ServerRecovery::Pending { .. });
}

#[tokio::test]
async fn rollback_from_conflict_canceling_failed() {
    let harness = Harness::new();
    harness.anchor.start_foreign_recovery(PhysicalFactor::App);
    let mut machine = ConflictMachine::new(harness.ctx.clone(), PhysicalFactor::App);
    let before = machine.state();

    harness
        .anchor
        .fail_next_cancel(TrustAnchorError::Transient("timeout".into()));
    assert_matches!(
        machine.on_cancel_recovery_conflict().await,
        Ok(ConflictState::CancelingFailed { .. })
    );
    assert_eq!(machine.rollback(), before);
}

#[tokio::test]
async fn rollback_from_clearing_failed() {
    let harness = Harness::new();
    let mut own = OwnRecoveryMachine::begin(harness.ctx.clone(), PhysicalFactor::App);
    own.initiate().await;
    harness.anchor.set_status(ServerRecovery::NoRecovery);
    harness.oracle.refresh().await.unwrap();

    let mut machine = NoLongerRecoveringMachine::new(harness.ctx.clone(), PhysicalFactor::App);
    let before = machine.state();
    harness.store.fail_next_clears(1);
    assert_matches!(
        machine.on_acknowledge().await,
        NoLongerRecoveringState::ClearingFailed { .. }
    );
    assert_eq!(machine.rollback(), before);
}

// ============================================================================
// 5. Remaining time is monotonic
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn remaining_never_increases(steps in prop::collection::vec(0u64..(36 * 3600), 1..20)) {
        runtime().block_on(async {
            let harness = Harness::new();
            let mut machine = OwnRecoveryMachine::begin(harness.ctx.clone(), PhysicalFactor::App);
            machine.initiate().await;

            let mut last = machine.remaining().unwrap();
            prop_assert_eq!(last, DEFAULT_DELAY);
            for step in steps {
                harness.clock.advance(Duration::from_secs(step));
                machine.tick();
                let remaining = machine.remaining().unwrap();
                prop_assert!(remaining <= last, "{:?} after {:?}", remaining, last);
                if remaining.is_zero() {
                    prop_assert!(
                        matches!(machine.state(), OwnRecoveryState::ReadyToComplete { .. }),
                        "{:?} with no time left",
                        machine.state()
                    );
                }
                last = remaining;
            }
            Ok(())
        })?;
    }
}
