//! Failure taxonomy shared by all recovery machines.
//!
//! Every `*Failed` state carries a [`FailureCause`]: a class the machine uses
//! to decide where `retry` goes, and a message the UI can show.

use serde::{Deserialize, Serialize};
use std::fmt;
use trikey_watch::{OracleError, TrustAnchorError};

/// How a failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Network hiccup; "try again" keeps everything collected so far
    Transient,
    /// The remote step succeeded but the local step did not; the next oracle
    /// read reconciles
    PartialFailure,
    /// The trust anchor state moved on (proof expired, already resolved)
    Conflict,
    /// Refused; retrying the same request will not help
    Terminal,
}

/// Human-presentable cause of a failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The remote step went through but local cleanup failed
    pub fn partial(error: &OracleError) -> Self {
        Self::new(
            FailureKind::PartialFailure,
            format!("Saved on the server, but local cleanup failed: {}", error),
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::Transient | FailureKind::PartialFailure
        )
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&TrustAnchorError> for FailureCause {
    fn from(error: &TrustAnchorError) -> Self {
        let kind = match error {
            TrustAnchorError::Transient(_) => FailureKind::Transient,
            TrustAnchorError::ProofExpired | TrustAnchorError::RecoveryAlreadyResolved => {
                FailureKind::Conflict
            }
            TrustAnchorError::Rejected(_) => FailureKind::Terminal,
        };
        Self::new(kind, error.to_string())
    }
}

impl From<&OracleError> for FailureCause {
    fn from(error: &OracleError) -> Self {
        match error {
            OracleError::TrustAnchor(e) => e.into(),
            OracleError::Store(_) => Self::new(FailureKind::Transient, error.to_string()),
            _ => Self::new(FailureKind::Terminal, error.to_string()),
        }
    }
}

/// An operation was invoked in a state that does not allow it.
///
/// Panics in debug builds; logs and leaves the state untouched in release.
pub(crate) fn invariant_violation(machine: &str, operation: &str, state: &impl fmt::Debug) {
    if cfg!(debug_assertions) {
        panic!("{machine}: {operation} is not legal in state {state:?}");
    }
    log::error!("{machine}: ignoring {operation} in state {state:?}");
}
