//! Recovery identifiers and the account-level recovery view

use crate::clock::Timestamp;
use crate::delay::DelayPeriod;
use crate::factor::PhysicalFactor;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account identifier at the trust anchor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier the trust anchor assigns to one recovery attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveryId(String);

impl RecoveryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecoveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-generated token so a retried request has at most one effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Fresh random key (16 bytes, hex encoded)
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn from_string(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Final authorization granted by the trust anchor once the delay elapsed.
///
/// Persisted locally so that a key rotation interrupted by a crash resumes
/// without asking the trust anchor again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionAuthorization {
    pub recovery_id: RecoveryId,
    pub idempotency_key: IdempotencyKey,
    pub authorized_at: Timestamp,
    /// Opaque grant consumed by key rotation
    pub token: String,
}

/// The account's recovery situation as seen from this device.
///
/// Exactly one value is current per account; it is always re-derived from
/// the trust anchor and the local record, never assumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Recovery {
    /// Nothing in progress
    NoActiveRecovery,
    /// A recovery this device did not start is active at the trust anchor
    SomeoneElseIsRecovering { lost_factor: PhysicalFactor },
    /// This device's own recovery, acknowledged by the trust anchor
    StillRecovering {
        lost_factor: PhysicalFactor,
        delay_period: DelayPeriod,
    },
    /// This device's own recovery was canceled elsewhere
    NoLongerRecovering { lost_factor: PhysicalFactor },
    /// A recovery this device did not start has completed: this device's
    /// factor set was replaced
    ConflictingRecoveryCompleted { lost_factor: PhysicalFactor },
}

impl Recovery {
    /// The factor claimed lost, if any recovery is in view
    pub fn lost_factor(&self) -> Option<PhysicalFactor> {
        match self {
            Recovery::NoActiveRecovery => None,
            Recovery::SomeoneElseIsRecovering { lost_factor }
            | Recovery::StillRecovering { lost_factor, .. }
            | Recovery::NoLongerRecovering { lost_factor }
            | Recovery::ConflictingRecoveryCompleted { lost_factor } => Some(*lost_factor),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Recovery::NoActiveRecovery)
    }
}
