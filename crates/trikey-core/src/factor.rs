//! Physical key factors

use serde::{Deserialize, Serialize};
use std::fmt;

/// A factor that can be physically lost and recovered.
///
/// The Server factor is never "lost" from the customer's point of view, so it
/// has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalFactor {
    /// Key held by the mobile app
    App,
    /// Key held by the hardware security chip
    Hardware,
}

impl PhysicalFactor {
    /// Whether canceling a conflicting recovery that claims this factor is
    /// lost requires a hardware proof of possession.
    pub fn requires_hardware_proof_to_contest(self) -> bool {
        match self {
            PhysicalFactor::Hardware => true,
            PhysicalFactor::App => false,
        }
    }
}

impl fmt::Display for PhysicalFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalFactor::App => write!(f, "app"),
            PhysicalFactor::Hardware => write!(f, "hardware"),
        }
    }
}
