//! Delay period evaluation.
//!
//! Pure logic: no I/O, no timers. Takes the server-set delay bounds and a
//! clock reading, returns how far along the delay is:
//!
//! ```text
//! start                                   end
//!   |---------- waiting (progress < 1) ----|---- completable
//! ```
//!
//! The `end` bound is authored by the trust anchor. A client moving its own
//! clock forward can only make the UI optimistic; the trust anchor rejects
//! early completion.

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors constructing a delay period
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DelayError {
    #[error("Delay period ends ({end}) before it starts ({start})")]
    EndBeforeStart { start: Timestamp, end: Timestamp },
}

/// The mandatory waiting window of a recovery. Always `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDelayPeriod")]
pub struct DelayPeriod {
    start: Timestamp,
    end: Timestamp,
}

#[derive(Deserialize)]
struct RawDelayPeriod {
    start: Timestamp,
    end: Timestamp,
}

impl TryFrom<RawDelayPeriod> for DelayPeriod {
    type Error = DelayError;

    fn try_from(raw: RawDelayPeriod) -> Result<Self, Self::Error> {
        DelayPeriod::new(raw.start, raw.end)
    }
}

impl DelayPeriod {
    /// Create a delay period, rejecting `end < start`.
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, DelayError> {
        if end < start {
            return Err(DelayError::EndBeforeStart { start, end });
        }
        Ok(Self { start, end })
    }

    /// Delay period of `length` starting at `start`.
    pub fn starting_at(start: Timestamp, length: Duration) -> Self {
        Self {
            start,
            end: start.saturating_add(length),
        }
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Total length of the delay
    pub fn length(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    /// `max(0, end - now)`
    pub fn remaining(&self, now: Timestamp) -> Duration {
        self.end.saturating_duration_since(now)
    }

    /// `clamp((now - start) / (end - start), 0, 1)`.
    ///
    /// A zero-length delay is always complete.
    pub fn progress(&self, now: Timestamp) -> f64 {
        let total = self.length().as_secs();
        if total == 0 {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.start).as_secs();
        (elapsed as f64 / total as f64).clamp(0.0, 1.0)
    }

    /// Whether the recovery may be completed at `now`.
    pub fn is_elapsed(&self, now: Timestamp) -> bool {
        self.remaining(now).is_zero()
    }
}
