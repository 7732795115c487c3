//! Trust anchor boundary
//!
//! The remote server serializes recovery attempts and enforces the delay.
//! HTTP, wire format and transport retries live in the implementation of
//! [`TrustAnchorRecoveryClient`]; this crate only sees the results.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trikey_core::{
    AccountId, Challenge, CompletionAuthorization, DelayPeriod, IdempotencyKey, PhysicalFactor,
    ProofOfPossession, RecoveryId,
};

/// Errors reported by the trust anchor, already classified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustAnchorError {
    /// Timeout, 5xx, connection reset. Safe to retry.
    #[error("Trust anchor unavailable: {0}")]
    Transient(String),

    /// The proof of possession is no longer accepted; collect a new one.
    #[error("Proof of possession expired")]
    ProofExpired,

    /// The recovery was already canceled or completed.
    #[error("Recovery already resolved at the trust anchor")]
    RecoveryAlreadyResolved,

    /// The request was refused (bad proof, delay not elapsed, ...).
    #[error("Trust anchor rejected request: {0}")]
    Rejected(String),
}

impl TrustAnchorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrustAnchorError::Transient(_))
    }
}

/// What the trust anchor reports about an account's recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerRecovery {
    /// No recovery pending, none completed
    NoRecovery,
    /// A recovery is waiting out (or has waited out) its delay
    Pending {
        recovery_id: RecoveryId,
        lost_factor: PhysicalFactor,
        delay_period: DelayPeriod,
    },
    /// The latest recovery completed and replaced the lost factor
    Completed {
        recovery_id: RecoveryId,
        lost_factor: PhysicalFactor,
    },
}

/// Result of starting a recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatedRecovery {
    pub recovery_id: RecoveryId,
    pub delay_period: DelayPeriod,
}

/// Cancellation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Required when contesting a recovery that claims the hardware is lost
    pub proof: Option<ProofOfPossession>,
    pub idempotency_key: IdempotencyKey,
}

/// Recovery operations offered by the trust anchor.
#[async_trait]
pub trait TrustAnchorRecoveryClient: Send + Sync {
    /// Current recovery state of the account
    async fn fetch_recovery(&self, account: &AccountId) -> Result<ServerRecovery, TrustAnchorError>;

    /// Start a recovery for `lost_factor`. The trust anchor sets the delay.
    async fn initiate_recovery(
        &self,
        account: &AccountId,
        lost_factor: PhysicalFactor,
        idempotency_key: &IdempotencyKey,
    ) -> Result<InitiatedRecovery, TrustAnchorError>;

    /// Fresh challenge for contesting the pending recovery
    async fn request_cancel_challenge(
        &self,
        account: &AccountId,
    ) -> Result<Challenge, TrustAnchorError>;

    /// Cancel the pending recovery
    async fn cancel_recovery(
        &self,
        account: &AccountId,
        request: &CancelRequest,
    ) -> Result<(), TrustAnchorError>;

    /// Final authorization once the delay elapsed
    async fn authorize_completion(
        &self,
        account: &AccountId,
        recovery_id: &RecoveryId,
        idempotency_key: &IdempotencyKey,
    ) -> Result<CompletionAuthorization, TrustAnchorError>;
}
