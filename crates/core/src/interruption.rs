//! Interruption detection on resume.
//!
//! A pure comparison of "now" with the session's last-activity timestamp. Bad
//! or missing data never blocks a resume: it simply reports no interruption.

use crate::session::{SessionState, parse_timestamp};
use chrono::{DateTime, Utc};

/// Default inactivity, in minutes, after which a session counts as interrupted.
pub const DEFAULT_INTERRUPTION_THRESHOLD_MINUTES: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interruption {
    pub interrupted: bool,
    pub minutes_elapsed: f64,
}

impl Interruption {
    const NONE: Interruption = Interruption {
        interrupted: false,
        minutes_elapsed: 0.0,
    };
}

/// Checks whether `state` was left idle for at least `threshold_minutes`.
pub fn detect_interruption(state: &SessionState, threshold_minutes: f64) -> Interruption {
    detect_interruption_at(state.last_message_ts.as_deref(), Utc::now(), threshold_minutes)
}

/// Same as [`detect_interruption`] against an explicit clock.
pub fn detect_interruption_at(
    last_activity: Option<&str>,
    now: DateTime<Utc>,
    threshold_minutes: f64,
) -> Interruption {
    let Some(raw) = last_activity else {
        return Interruption::NONE;
    };
    let Some(last) = parse_timestamp(raw) else {
        tracing::warn!(last_activity = raw, "Unparsable last-activity timestamp; assuming no interruption");
        return Interruption::NONE;
    };

    let minutes_elapsed = (now - last).num_milliseconds() as f64 / 60_000.0;
    Interruption {
        interrupted: minutes_elapsed >= threshold_minutes,
        minutes_elapsed,
    }
}
