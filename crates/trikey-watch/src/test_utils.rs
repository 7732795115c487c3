//! Shared test utilities: an in-memory trust anchor.
//!
//! Behaves like the real service for the parts the recovery protocol relies
//! on: one recovery at a time, server-set delay, idempotent requests,
//! challenge-bound proofs. Failures can be scripted per operation.

use crate::anchor::{
    CancelRequest, InitiatedRecovery, ServerRecovery, TrustAnchorError, TrustAnchorRecoveryClient,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use trikey_core::{
    AccountId, Challenge, Clock, CompletionAuthorization, DelayPeriod, IdempotencyKey,
    ManualClock, PhysicalFactor, ProofOfPossession, RecoveryId, XOnlyPublicKey,
};

/// Default delay the fake applies to new recoveries (7 days)
pub const DEFAULT_DELAY: Duration = Duration::from_secs(7 * 24 * 3600);

/// A request the fake received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorCall {
    Fetch,
    Initiate {
        lost_factor: PhysicalFactor,
        idempotency_key: IdempotencyKey,
    },
    Challenge,
    Cancel(CancelRequest),
    Authorize {
        recovery_id: RecoveryId,
        idempotency_key: IdempotencyKey,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Fetch,
    Initiate,
    Challenge,
    Cancel,
    Authorize,
}

#[derive(Default)]
struct FakeState {
    status: Option<ServerRecovery>,
    next_id: u32,
    hardware_key: Option<XOnlyPublicKey>,
    outstanding_challenge: Option<Challenge>,
    failures: HashMap<Op, VecDeque<TrustAnchorError>>,
    /// Failures returned *after* the operation took effect (lost response)
    lost_responses: HashMap<Op, u32>,
    initiated: HashMap<IdempotencyKey, InitiatedRecovery>,
    canceled: Vec<IdempotencyKey>,
    authorized: HashMap<IdempotencyKey, CompletionAuthorization>,
    calls: Vec<AnchorCall>,
}

/// In-memory trust anchor for a single account
pub struct FakeTrustAnchor {
    clock: ManualClock,
    delay: Duration,
    state: Mutex<FakeState>,
}

impl FakeTrustAnchor {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            delay: DEFAULT_DELAY,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Require proofs for hardware-loss disputes to be signed by `key`
    pub fn with_hardware_key(self, key: XOnlyPublicKey) -> Self {
        self.lock().hardware_key = Some(key);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Overwrite what the trust anchor reports (e.g. an attacker's recovery)
    pub fn set_status(&self, status: ServerRecovery) {
        self.lock().status = Some(status);
    }

    /// Start a recovery not initiated by the device under test
    pub fn start_foreign_recovery(&self, lost_factor: PhysicalFactor) -> RecoveryId {
        let mut state = self.lock();
        state.next_id += 1;
        let recovery_id = RecoveryId::new(format!("foreign-{}", state.next_id));
        state.status = Some(ServerRecovery::Pending {
            recovery_id: recovery_id.clone(),
            lost_factor,
            delay_period: DelayPeriod::starting_at(self.clock.now(), self.delay),
        });
        recovery_id
    }

    /// Complete whatever recovery is pending, as if its initiator finished it
    pub fn complete_pending(&self) {
        let mut state = self.lock();
        if let Some(ServerRecovery::Pending {
            recovery_id,
            lost_factor,
            ..
        }) = state.status.clone()
        {
            state.status = Some(ServerRecovery::Completed {
                recovery_id,
                lost_factor,
            });
        }
    }

    pub fn status(&self) -> ServerRecovery {
        self.lock()
            .status
            .clone()
            .unwrap_or(ServerRecovery::NoRecovery)
    }

    pub fn fail_next_fetch(&self, error: TrustAnchorError) {
        self.push_failure(Op::Fetch, error);
    }

    pub fn fail_next_initiate(&self, error: TrustAnchorError) {
        self.push_failure(Op::Initiate, error);
    }

    pub fn fail_next_challenge(&self, error: TrustAnchorError) {
        self.push_failure(Op::Challenge, error);
    }

    pub fn fail_next_cancel(&self, error: TrustAnchorError) {
        self.push_failure(Op::Cancel, error);
    }

    pub fn fail_next_authorize(&self, error: TrustAnchorError) {
        self.push_failure(Op::Authorize, error);
    }

    /// The next authorize takes effect but its response is lost
    pub fn lose_next_authorize_response(&self) {
        *self.lock().lost_responses.entry(Op::Authorize).or_default() += 1;
    }

    /// The next cancel takes effect but its response is lost
    pub fn lose_next_cancel_response(&self) {
        *self.lock().lost_responses.entry(Op::Cancel).or_default() += 1;
    }

    pub fn calls(&self) -> Vec<AnchorCall> {
        self.lock().calls.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.count(|c| matches!(c, AnchorCall::Fetch))
    }

    pub fn challenge_count(&self) -> usize {
        self.count(|c| matches!(c, AnchorCall::Challenge))
    }

    pub fn cancel_requests(&self) -> Vec<CancelRequest> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                AnchorCall::Cancel(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn authorize_count(&self) -> usize {
        self.count(|c| matches!(c, AnchorCall::Authorize { .. }))
    }

    fn count(&self, f: impl Fn(&AnchorCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| f(c)).count()
    }

    fn push_failure(&self, op: Op, error: TrustAnchorError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, op: Op, call: AnchorCall) -> Result<std::sync::MutexGuard<'_, FakeState>, TrustAnchorError> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(error) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        Ok(state)
    }

    fn take_lost_response(state: &mut FakeState, op: Op) -> bool {
        match state.lost_responses.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl TrustAnchorRecoveryClient for FakeTrustAnchor {
    async fn fetch_recovery(&self, _account: &AccountId) -> Result<ServerRecovery, TrustAnchorError> {
        let state = self.begin(Op::Fetch, AnchorCall::Fetch)?;
        Ok(state.status.clone().unwrap_or(ServerRecovery::NoRecovery))
    }

    async fn initiate_recovery(
        &self,
        _account: &AccountId,
        lost_factor: PhysicalFactor,
        idempotency_key: &IdempotencyKey,
    ) -> Result<InitiatedRecovery, TrustAnchorError> {
        let mut state = self.begin(
            Op::Initiate,
            AnchorCall::Initiate {
                lost_factor,
                idempotency_key: idempotency_key.clone(),
            },
        )?;

        if let Some(existing) = state.initiated.get(idempotency_key) {
            return Ok(existing.clone());
        }
        if let Some(ServerRecovery::Pending { .. }) = state.status {
            return Err(TrustAnchorError::Rejected(
                "another recovery is already pending".into(),
            ));
        }

        state.next_id += 1;
        let initiated = InitiatedRecovery {
            recovery_id: RecoveryId::new(format!("recovery-{}", state.next_id)),
            delay_period: DelayPeriod::starting_at(self.clock.now(), self.delay),
        };
        state.status = Some(ServerRecovery::Pending {
            recovery_id: initiated.recovery_id.clone(),
            lost_factor,
            delay_period: initiated.delay_period,
        });
        state
            .initiated
            .insert(idempotency_key.clone(), initiated.clone());
        Ok(initiated)
    }

    async fn request_cancel_challenge(
        &self,
        _account: &AccountId,
    ) -> Result<Challenge, TrustAnchorError> {
        let mut state = self.begin(Op::Challenge, AnchorCall::Challenge)?;
        let challenge = Challenge::random();
        state.outstanding_challenge = Some(challenge);
        Ok(challenge)
    }

    async fn cancel_recovery(
        &self,
        _account: &AccountId,
        request: &CancelRequest,
    ) -> Result<(), TrustAnchorError> {
        let mut state = self.begin(Op::Cancel, AnchorCall::Cancel(request.clone()))?;

        if state.canceled.contains(&request.idempotency_key) {
            return Ok(());
        }
        let (recovery_id, lost_factor) = match &state.status {
            Some(ServerRecovery::Pending {
                recovery_id,
                lost_factor,
                ..
            }) => (recovery_id.clone(), *lost_factor),
            _ => return Err(TrustAnchorError::RecoveryAlreadyResolved),
        };
        // The initiating session may withdraw its own recovery
        let initiated_by_caller = state
            .initiated
            .values()
            .any(|initiated| initiated.recovery_id == recovery_id);

        if lost_factor == PhysicalFactor::Hardware && !initiated_by_caller {
            let proof: &ProofOfPossession = request.proof.as_ref().ok_or_else(|| {
                TrustAnchorError::Rejected("hardware proof of possession required".into())
            })?;
            let challenge = state
                .outstanding_challenge
                .ok_or(TrustAnchorError::ProofExpired)?;
            if proof.challenge != challenge {
                return Err(TrustAnchorError::ProofExpired);
            }
            if let Some(key) = state.hardware_key {
                proof
                    .verify(&key, &challenge)
                    .map_err(|e| TrustAnchorError::Rejected(e.to_string()))?;
            }
            // Single use
            state.outstanding_challenge = None;
        }

        state.status = Some(ServerRecovery::NoRecovery);
        state.canceled.push(request.idempotency_key.clone());

        if Self::take_lost_response(&mut state, Op::Cancel) {
            return Err(TrustAnchorError::Transient("response lost".into()));
        }
        Ok(())
    }

    async fn authorize_completion(
        &self,
        _account: &AccountId,
        recovery_id: &RecoveryId,
        idempotency_key: &IdempotencyKey,
    ) -> Result<CompletionAuthorization, TrustAnchorError> {
        let mut state = self.begin(
            Op::Authorize,
            AnchorCall::Authorize {
                recovery_id: recovery_id.clone(),
                idempotency_key: idempotency_key.clone(),
            },
        )?;

        if let Some(existing) = state.authorized.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let (lost_factor, delay_period) = match &state.status {
            Some(ServerRecovery::Pending {
                recovery_id: pending,
                lost_factor,
                delay_period,
            }) if pending == recovery_id => (*lost_factor, *delay_period),
            _ => return Err(TrustAnchorError::RecoveryAlreadyResolved),
        };

        let now = self.clock.now();
        if !delay_period.is_elapsed(now) {
            return Err(TrustAnchorError::Rejected(
                "delay period has not elapsed".into(),
            ));
        }

        let authorization = CompletionAuthorization {
            recovery_id: recovery_id.clone(),
            idempotency_key: idempotency_key.clone(),
            authorized_at: now,
            token: format!("grant-{}", recovery_id),
        };
        state.status = Some(ServerRecovery::Completed {
            recovery_id: recovery_id.clone(),
            lost_factor,
        });
        state
            .authorized
            .insert(idempotency_key.clone(), authorization.clone());

        if Self::take_lost_response(&mut state, Op::Authorize) {
            return Err(TrustAnchorError::Transient("response lost".into()));
        }
        Ok(authorization)
    }
}
