//! End-to-end recovery scenarios.
//!
//! Drives the orchestrator and machines against an in-memory trust anchor,
//! fake hardware and a real JSON state file:
//!
//! A. Contesting a "hardware lost" recovery with a proof of possession
//! B. Contesting an "app lost" recovery directly
//! C. Retrying a failed cancel without a new hardware tap
//! D. Rolling back a failed cancel
//! E. Resuming an own recovery whose delay ended while the app was closed
//!
//! Run with: cargo test --test recovery_scenarios

use assert_matches::assert_matches;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use trikey_core::{AccountId, ManualClock, PhysicalFactor, Recovery, Timestamp};
use trikey_recovery::test_utils::{
    test_keypair, AnchorCall, FakeHardware, FakeRotator, FakeTrustAnchor, Harness, DEFAULT_DELAY,
};
use trikey_recovery::{
    ActiveMachine, ConflictState, HardwareProofSession, OwnRecoveryState, RecoveryContext,
    RecoveryOrchestrator,
};
use trikey_watch::{
    JsonFileRecoveryStore, LocalRecovery, LocalRecoveryStore, RecoveryStatusOracle,
    ServerRecovery, TrustAnchorError,
};

/// Orchestrator already showing someone else's recovery of `lost_factor`
async fn contested(harness: &Harness, lost_factor: PhysicalFactor) -> RecoveryOrchestrator {
    harness.anchor.start_foreign_recovery(lost_factor);
    let mut orchestrator = RecoveryOrchestrator::new(harness.ctx.clone());
    assert_matches!(orchestrator.sync().await, ActiveMachine::Conflict(_));
    orchestrator
}

// ============================================================================
// Scenario A: hardware-lost claim needs a proof of possession
// ============================================================================

#[tokio::test]
async fn scenario_a_hardware_claim_contested_with_proof() {
    let harness = Harness::new();
    let mut orchestrator = contested(&harness, PhysicalFactor::Hardware).await;
    let conflict = orchestrator.conflict().unwrap();

    let state = conflict.on_cancel_recovery_conflict().await.unwrap();
    let ConflictState::AwaitingHardwareProofOfPossession {
        lost_factor,
        challenge,
    } = state
    else {
        panic!("expected a proof request, got {:?}", state);
    };
    assert_eq!(lost_factor, PhysicalFactor::Hardware);

    // The wallet UI runs the NFC session and hands the proof back
    let proof = harness
        .hardware
        .request_proof_of_possession(challenge)
        .await
        .unwrap();
    let mut states = conflict.subscribe();
    let state = conflict.on_complete(proof.clone()).await;
    assert_eq!(
        state,
        ConflictState::Done {
            lost_factor: PhysicalFactor::Hardware
        }
    );
    assert!(states.has_changed().unwrap());

    // Cancel carried the proof
    let requests = harness.anchor.cancel_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].proof, Some(proof));

    // Oracle emits NoActiveRecovery and the orchestrator goes idle
    let mut observations = Box::pin(harness.oracle.observe());
    assert_eq!(
        observations.next().await,
        Some(Ok(Recovery::NoActiveRecovery))
    );
    assert!(orchestrator.sync().await.is_idle());
}

// ============================================================================
// Scenario B: app-lost claim is contested directly
// ============================================================================

#[tokio::test]
async fn scenario_b_app_claim_contested_directly() {
    let harness = Harness::new();
    let mut orchestrator = contested(&harness, PhysicalFactor::App).await;

    let state = orchestrator
        .conflict()
        .unwrap()
        .on_cancel_recovery_conflict()
        .await
        .unwrap();
    assert_eq!(
        state,
        ConflictState::Done {
            lost_factor: PhysicalFactor::App
        }
    );

    assert!(!harness.anchor.calls().contains(&AnchorCall::Challenge));
    assert_eq!(harness.hardware.session_count(), 0);
    assert_eq!(harness.anchor.cancel_requests()[0].proof, None);
    assert_eq!(
        harness.oracle.current(),
        Some(Ok(Recovery::NoActiveRecovery))
    );
    assert!(orchestrator.sync().await.is_idle());
}

// ============================================================================
// Scenario C: retryable failure, retry without a new proof
// ============================================================================

#[tokio::test]
async fn scenario_c_retry_after_transient_failure() {
    let harness = Harness::new();
    let mut orchestrator = contested(&harness, PhysicalFactor::Hardware).await;
    let conflict = orchestrator.conflict().unwrap();

    conflict.on_cancel_recovery_conflict().await.unwrap();
    harness
        .anchor
        .fail_next_cancel(TrustAnchorError::Transient("gateway timeout".into()));
    let state = conflict.request_proof().await.unwrap();
    assert_matches!(
        state,
        ConflictState::CancelingFailed {
            lost_factor: PhysicalFactor::Hardware,
            proof: Some(_),
            ..
        }
    );

    // The orchestrator keeps the failed machine across reads
    assert_matches!(orchestrator.sync().await, ActiveMachine::Conflict(_));

    let conflict = orchestrator.conflict().unwrap();
    let mut states = conflict.subscribe();
    let retried = tokio::spawn(async move {
        // First transition after retry is the canceling state, carrying the old proof
        states.changed().await.unwrap();
        states.borrow_and_update().clone()
    });
    assert_matches!(conflict.retry().await, ConflictState::Done { .. });
    assert_matches!(
        retried.await.unwrap(),
        ConflictState::CancelingConflictingRecovery { proof: Some(_), .. }
            | ConflictState::Done { .. }
    );

    assert_eq!(harness.hardware.session_count(), 1);
    let requests = harness.anchor.cancel_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);
    assert!(orchestrator.sync().await.is_idle());
}

// ============================================================================
// Scenario D: rollback keeps the claimed lost factor
// ============================================================================

#[tokio::test]
async fn scenario_d_rollback_restores_conflict() {
    let harness = Harness::new();
    let mut orchestrator = contested(&harness, PhysicalFactor::Hardware).await;
    let conflict = orchestrator.conflict().unwrap();

    conflict.on_cancel_recovery_conflict().await.unwrap();
    harness
        .anchor
        .fail_next_cancel(TrustAnchorError::Transient("connection reset".into()));
    assert_matches!(
        conflict.request_proof().await.unwrap(),
        ConflictState::CancelingFailed { .. }
    );

    assert_eq!(
        conflict.rollback(),
        ConflictState::ShowingConflict {
            lost_factor: PhysicalFactor::Hardware
        }
    );
    // Foreign recovery is untouched
    assert_matches!(harness.anchor.status(), ServerRecovery::Pending { .. });
}

// ============================================================================
// Scenario E: delay ended while the app was closed
// ============================================================================

struct Device {
    oracle: Arc<RecoveryStatusOracle>,
    ctx: RecoveryContext,
}

/// One app launch: fresh oracle over the same state file
fn launch(anchor: &Arc<FakeTrustAnchor>, clock: &ManualClock, state_file: &Path) -> Device {
    let store = Arc::new(JsonFileRecoveryStore::new(state_file));
    let oracle = Arc::new(RecoveryStatusOracle::new(
        AccountId::new("acct-e"),
        anchor.clone(),
        store,
    ));
    let ctx = RecoveryContext::new(
        oracle.clone(),
        Arc::new(FakeHardware::new(test_keypair(1))),
        Arc::new(FakeRotator::new()),
        Arc::new(clock.clone()),
    );
    Device { oracle, ctx }
}

#[tokio::test]
async fn scenario_e_resume_after_delay_is_ready() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("recovery_state.json");
    let clock = ManualClock::new(Timestamp(1_700_000_000));
    let anchor = Arc::new(FakeTrustAnchor::new(clock.clone()));

    {
        let device = launch(&anchor, &clock, &state_file);
        let mut orchestrator = RecoveryOrchestrator::new(device.ctx.clone());
        assert_matches!(
            orchestrator.start_recovery(PhysicalFactor::Hardware).await,
            Ok(OwnRecoveryState::WaitingForDelayPeriod { .. })
        );
    }
    assert!(state_file.exists());

    // App closed for longer than the delay
    clock.advance(DEFAULT_DELAY + Duration::from_secs(3 * 3600));

    let device = launch(&anchor, &clock, &state_file);
    let mut orchestrator = RecoveryOrchestrator::new(device.ctx.clone());
    orchestrator.sync().await;
    let own = orchestrator.own_recovery().unwrap();
    assert_matches!(
        own.state(),
        OwnRecoveryState::ReadyToComplete {
            lost_factor: PhysicalFactor::Hardware,
            ..
        }
    );
    assert_eq!(own.remaining(), Some(Duration::ZERO));
    assert_eq!(own.progress(), Some(1.0));

    assert_matches!(own.complete().await, OwnRecoveryState::Done { .. });
    assert_matches!(
        JsonFileRecoveryStore::new(&state_file).read().unwrap(),
        Some(LocalRecovery::Completed { .. })
    );
    assert_eq!(
        device.oracle.current(),
        Some(Ok(Recovery::NoActiveRecovery))
    );
}

// ============================================================================
// Recovery lost race
// ============================================================================

#[tokio::test]
async fn adversarial_completion_is_surfaced() {
    let harness = Harness::new();
    let mut orchestrator = contested(&harness, PhysicalFactor::App).await;

    // Delay runs out before the user acts
    harness.clock.advance(DEFAULT_DELAY);
    harness.anchor.complete_pending();

    assert_matches!(
        orchestrator.sync().await,
        ActiveMachine::RecoveryLost {
            lost_factor: PhysicalFactor::App
        }
    );
    assert_eq!(
        harness.oracle.current(),
        Some(Ok(Recovery::ConflictingRecoveryCompleted {
            lost_factor: PhysicalFactor::App
        }))
    );
}

// ============================================================================
// Initiate landed but was never recorded
// ============================================================================

fn initiate_keys(harness: &Harness) -> Vec<trikey_core::IdempotencyKey> {
    harness
        .anchor
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            AnchorCall::Initiate {
                idempotency_key, ..
            } => Some(idempotency_key),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn unrecorded_initiate_is_not_mistaken_for_a_conflict() {
    let harness = Harness::new();
    let mut orchestrator = RecoveryOrchestrator::new(harness.ctx.clone());

    harness.store.fail_next_persists(1);
    assert_matches!(
        orchestrator.start_recovery(PhysicalFactor::App).await,
        Ok(OwnRecoveryState::InitiationFailed { .. })
    );
    let recovery_id = match harness.anchor.status() {
        ServerRecovery::Pending { recovery_id, .. } => recovery_id,
        other => panic!("expected a pending recovery, got {:?}", other),
    };

    // Without a local record the pending recovery looks foreign; the replay
    // under the same key claims it back
    assert_matches!(
        orchestrator.sync().await,
        ActiveMachine::OwnRecovery(m)
            if matches!(m.state(), OwnRecoveryState::WaitingForDelayPeriod { .. })
    );
    assert_matches!(
        harness.oracle.current(),
        Some(Ok(Recovery::StillRecovering {
            lost_factor: PhysicalFactor::App,
            ..
        }))
    );
    let own = harness.oracle.own_recovery().unwrap().unwrap();
    assert_eq!(own.recovery_id, recovery_id);

    let keys = initiate_keys(&harness);
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], keys[1]);
    assert_eq!(harness.hardware.session_count(), 0);
}

#[tokio::test]
async fn unrecorded_initiate_survives_failed_replay() {
    let harness = Harness::new();
    let mut orchestrator = RecoveryOrchestrator::new(harness.ctx.clone());

    harness.store.fail_next_persists(1);
    orchestrator
        .start_recovery(PhysicalFactor::Hardware)
        .await
        .unwrap();

    harness
        .anchor
        .fail_next_initiate(TrustAnchorError::Transient("timeout".into()));
    assert_matches!(
        orchestrator.sync().await,
        ActiveMachine::OwnRecovery(m)
            if matches!(m.state(), OwnRecoveryState::InitiationFailed { .. })
    );

    assert_matches!(
        orchestrator.sync().await,
        ActiveMachine::OwnRecovery(m)
            if matches!(m.state(), OwnRecoveryState::WaitingForDelayPeriod { .. })
    );
    let keys = initiate_keys(&harness);
    assert_eq!(keys.len(), 3);
    assert!(keys.iter().all(|key| *key == keys[0]));
}

#[tokio::test]
async fn foreign_recovery_during_failed_initiate_is_a_conflict() {
    let harness = Harness::new();
    let mut orchestrator = RecoveryOrchestrator::new(harness.ctx.clone());

    // Our request never reached the trust anchor
    harness
        .anchor
        .fail_next_initiate(TrustAnchorError::Transient("connection reset".into()));
    orchestrator
        .start_recovery(PhysicalFactor::App)
        .await
        .unwrap();
    harness.anchor.start_foreign_recovery(PhysicalFactor::App);

    // The replay is refused, so the pending recovery is someone else's
    assert_matches!(
        orchestrator.sync().await,
        ActiveMachine::Conflict(m)
            if m.state() == ConflictState::ShowingConflict { lost_factor: PhysicalFactor::App }
    );
    assert!(harness.oracle.own_recovery().unwrap().is_none());
}
