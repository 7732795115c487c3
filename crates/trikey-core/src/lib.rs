//! Trikey Core
//!
//! Shared value types for the delay-and-notify recovery protocol of a
//! 2-of-3 wallet (App key, Hardware key, Server key).
//!
//! # Factors
//!
//! Only the two physical factors can be lost and recovered:
//! - **App**: the key held by the mobile app (lost on reinstall / device loss)
//! - **Hardware**: the key held by the security chip
//!
//! # Delay Period
//!
//! A recovery only becomes completable once the server-set delay period has
//! elapsed, judged against an injected [`Clock`].

pub mod clock;
pub mod delay;
pub mod factor;
pub mod proof;
pub mod recovery;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use delay::{DelayError, DelayPeriod};
pub use factor::PhysicalFactor;
pub use proof::{
    keypair_from_secret_bytes, Challenge, Keypair, ProofError, ProofOfPossession, XOnlyPublicKey,
};
pub use recovery::{
    AccountId, CompletionAuthorization, IdempotencyKey, Recovery, RecoveryId,
};
