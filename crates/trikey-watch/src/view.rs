//! Deriving the device's recovery view from the trust anchor report and the
//! local record.
//!
//! The trust anchor is authoritative for *which* recovery is active; the
//! local record only says whether that recovery is ours.

use crate::anchor::ServerRecovery;
use crate::store::LocalRecovery;
use trikey_core::Recovery;

/// Combine the trust anchor report with the local record.
pub fn derive_recovery(server: &ServerRecovery, local: Option<&LocalRecovery>) -> Recovery {
    match server {
        ServerRecovery::NoRecovery => match local {
            Some(LocalRecovery::InFlight(own)) => Recovery::NoLongerRecovering {
                lost_factor: own.lost_factor,
            },
            Some(LocalRecovery::Completed { .. }) | None => Recovery::NoActiveRecovery,
        },

        ServerRecovery::Pending {
            recovery_id,
            lost_factor,
            delay_period,
        } => match local {
            Some(LocalRecovery::InFlight(own)) if &own.recovery_id == recovery_id => {
                if own.lost_factor != *lost_factor {
                    // Same attempt can never change factor; distrust the record
                    log::error!(
                        "Recovery {} reports lost factor {} but local record says {}",
                        recovery_id,
                        lost_factor,
                        own.lost_factor
                    );
                    return Recovery::SomeoneElseIsRecovering {
                        lost_factor: *lost_factor,
                    };
                }
                Recovery::StillRecovering {
                    lost_factor: *lost_factor,
                    delay_period: *delay_period,
                }
            }
            _ => Recovery::SomeoneElseIsRecovering {
                lost_factor: *lost_factor,
            },
        },

        ServerRecovery::Completed {
            recovery_id,
            lost_factor,
        } => match local {
            // Authorized but key rotation not finished locally
            Some(LocalRecovery::InFlight(own)) if &own.recovery_id == recovery_id => {
                Recovery::StillRecovering {
                    lost_factor: own.lost_factor,
                    delay_period: own.delay_period,
                }
            }
            Some(LocalRecovery::Completed { recovery_id: ours }) if ours == recovery_id => {
                Recovery::NoActiveRecovery
            }
            _ => Recovery::ConflictingRecoveryCompleted {
                lost_factor: *lost_factor,
            },
        },
    }
}
