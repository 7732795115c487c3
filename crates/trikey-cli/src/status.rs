//! Human-readable report of the local recovery record.
//!
//! Offline: this only shows what this device remembers. The trust anchor
//! stays authoritative for whether the recovery is still active.

use std::fmt::Write;
use std::time::Duration;
use trikey_core::Timestamp;
use trikey_watch::LocalRecovery;

pub fn render(record: Option<&LocalRecovery>, now: Timestamp) -> String {
    let mut out = String::new();
    match record {
        None => {
            let _ = writeln!(out, "No recovery recorded on this device.");
        }
        Some(LocalRecovery::Completed { recovery_id }) => {
            let _ = writeln!(out, "Last recovery {} completed.", recovery_id);
        }
        Some(LocalRecovery::InFlight(own)) => {
            let delay = own.delay_period;
            let _ = writeln!(out, "Recovery:      {}", own.recovery_id);
            let _ = writeln!(out, "Lost factor:   {}", own.lost_factor);
            let _ = writeln!(
                out,
                "Delay:         {} → {}",
                delay.start(),
                delay.end()
            );
            let _ = writeln!(
                out,
                "Progress:      {:.0}%",
                delay.progress(now) * 100.0
            );
            if delay.is_elapsed(now) {
                let _ = writeln!(out, "Remaining:     none, ready to complete");
            } else {
                let _ = writeln!(
                    out,
                    "Remaining:     {}",
                    format_duration(delay.remaining(now))
                );
            }
            let _ = writeln!(
                out,
                "Authorized:    {}",
                if own.authorization.is_some() { "yes" } else { "no" }
            );
        }
    }
    out
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs % 60)
    }
}
