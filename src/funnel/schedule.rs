//! Delay computation for funnel steps.
//!
//! Anchors are persisted timestamps on the user record, so a restart
//! recomputes the remaining wait instead of resetting it.

use crate::funnel::evaluator::FunnelStep;
use crate::funnel::store::FunnelUser;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// The anchor timestamp a step's wait interval is measured from.
///
/// Step 3 anchors on the trigger stamp when the trigger fired, which moves
/// the final message relative to the stop event rather than the last send.
pub fn step_anchor(user: &FunnelUser, step: FunnelStep) -> Option<DateTime<Utc>> {
    match step {
        FunnelStep::First => user.first_message_at,
        FunnelStep::Second => user.last_send_attempt_at,
        FunnelStep::Third => {
            if user.trigger_fired {
                user.trigger_fired_at
            } else {
                user.last_send_attempt_at
            }
        }
    }
}

/// Remaining wait before a step may be dispatched: the configured interval
/// minus the time already elapsed since the anchor. Never negative; an
/// interval that has already elapsed waits zero. An anchor in the future
/// counts as zero elapsed time.
pub fn remaining_wait(now: DateTime<Utc>, anchor: DateTime<Utc>, interval: Duration) -> Duration {
    let elapsed = (now - anchor).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(elapsed)
}
