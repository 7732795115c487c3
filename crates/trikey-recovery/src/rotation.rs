//! Key material rotation after a completed recovery

use async_trait::async_trait;
use thiserror::Error;
use trikey_core::{CompletionAuthorization, PhysicalFactor};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    #[error("Hardware session failed during rotation: {0}")]
    Hardware(String),

    #[error("Failed to store new descriptor: {0}")]
    Storage(String),

    #[error("Authorization refused by signer: {0}")]
    Refused(String),
}

/// Replaces the lost factor's keys and rewrites the wallet descriptor.
///
/// Must be idempotent for a given authorization: a resumed completion may
/// rotate with the same authorization twice.
#[async_trait]
pub trait KeyMaterialRotator: Send + Sync {
    async fn rotate(
        &self,
        lost_factor: PhysicalFactor,
        authorization: &CompletionAuthorization,
    ) -> Result<(), RotationError>;
}
