//! Fakes for driving the machines without devices or a server.

use crate::hardware::{HardwareError, HardwareProofSession};
use crate::rotation::{KeyMaterialRotator, RotationError};
use crate::RecoveryContext;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use trikey_core::{
    keypair_from_secret_bytes, Challenge, CompletionAuthorization, Keypair, ManualClock,
    PhysicalFactor, ProofOfPossession, Timestamp,
};
use trikey_watch::{MemoryRecoveryStore, RecoveryStatusOracle};

pub use trikey_watch::test_utils::{AnchorCall, FakeTrustAnchor, DEFAULT_DELAY};

/// Deterministic keypair; `seed` must be non-zero
pub fn test_keypair(seed: u8) -> Keypair {
    keypair_from_secret_bytes(&[seed; 32]).expect("non-zero seed is a valid secret key")
}

#[derive(Default)]
struct HardwareState {
    failures: VecDeque<HardwareError>,
    challenges: Vec<Challenge>,
}

/// Hardware that signs every challenge unless told to fail
pub struct FakeHardware {
    keypair: Keypair,
    latency: Duration,
    state: Mutex<HardwareState>,
}

impl FakeHardware {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            latency: Duration::ZERO,
            state: Mutex::new(HardwareState::default()),
        }
    }

    /// Hold each session open this long (to exercise exclusivity)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_next(&self, error: HardwareError) {
        self.lock().failures.push_back(error);
    }

    /// Sessions started, successful or not
    pub fn session_count(&self) -> usize {
        self.lock().challenges.len()
    }

    pub fn challenges(&self) -> Vec<Challenge> {
        self.lock().challenges.clone()
    }

    fn lock(&self) -> MutexGuard<'_, HardwareState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl HardwareProofSession for FakeHardware {
    async fn request_proof_of_possession(
        &self,
        challenge: Challenge,
    ) -> Result<ProofOfPossession, HardwareError> {
        let failure = {
            let mut state = self.lock();
            state.challenges.push(challenge);
            state.failures.pop_front()
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(ProofOfPossession::sign(
                &self.keypair,
                PhysicalFactor::Hardware,
                challenge,
            )),
        }
    }
}

#[derive(Default)]
struct RotatorState {
    failures: VecDeque<RotationError>,
    rotations: Vec<CompletionAuthorization>,
}

/// Records successful rotations
#[derive(Default)]
pub struct FakeRotator {
    state: Mutex<RotatorState>,
}

impl FakeRotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: RotationError) {
        self.lock().failures.push_back(error);
    }

    pub fn rotation_count(&self) -> usize {
        self.lock().rotations.len()
    }

    pub fn rotations(&self) -> Vec<CompletionAuthorization> {
        self.lock().rotations.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RotatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KeyMaterialRotator for FakeRotator {
    async fn rotate(
        &self,
        _lost_factor: PhysicalFactor,
        authorization: &CompletionAuthorization,
    ) -> Result<(), RotationError> {
        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.rotations.push(authorization.clone());
        Ok(())
    }
}

/// One account wired to fakes, sharing a manual clock
pub struct Harness {
    pub clock: ManualClock,
    pub anchor: Arc<FakeTrustAnchor>,
    pub store: Arc<MemoryRecoveryStore>,
    pub hardware: Arc<FakeHardware>,
    pub rotator: Arc<FakeRotator>,
    pub oracle: Arc<RecoveryStatusOracle>,
    pub ctx: RecoveryContext,
}

impl Harness {
    pub fn new() -> Self {
        let clock = ManualClock::new(Timestamp(1_700_000_000));
        let hardware_key = test_keypair(1);
        let anchor = Arc::new(
            FakeTrustAnchor::new(clock.clone()).with_hardware_key(hardware_key.x_only_public_key().0),
        );
        let store = Arc::new(MemoryRecoveryStore::new());
        let hardware = Arc::new(FakeHardware::new(hardware_key));
        let rotator = Arc::new(FakeRotator::new());
        let oracle = Arc::new(RecoveryStatusOracle::new(
            trikey_core::AccountId::new("test-account"),
            anchor.clone(),
            store.clone(),
        ));
        let ctx = RecoveryContext::new(
            oracle.clone(),
            hardware.clone(),
            rotator.clone(),
            Arc::new(clock.clone()),
        );
        Self {
            clock,
            anchor,
            store,
            hardware,
            rotator,
            oracle,
            ctx,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
