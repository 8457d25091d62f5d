//! Pure step-eligibility decision logic.
//!
//! The eligibility table is data rather than control flow, so step
//! policies can be adjusted in one place without touching the dispatch
//! pipeline.

use crate::funnel::policy::ContentPolicy;
use crate::funnel::store::{FunnelUser, UserStatus};

/// One of the three scripted funnel steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelStep {
    First,
    Second,
    Third,
}

impl FunnelStep {
    pub const ALL: [FunnelStep; 3] = [FunnelStep::First, FunnelStep::Second, FunnelStep::Third];

    pub fn number(self) -> i64 {
        match self {
            FunnelStep::First => 1,
            FunnelStep::Second => 2,
            FunnelStep::Third => 3,
        }
    }

    pub(crate) fn index(self) -> usize {
        (self.number() - 1) as usize
    }
}

impl std::fmt::Display for FunnelStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Eligibility predicate for one funnel step.
pub struct StepRule {
    pub step: FunnelStep,
    pub eligible: fn(&FunnelUser) -> bool,
}

/// The production eligibility table, walked in order for every inbound
/// event.
///
/// Step 3 also fires from `last_step_sent == 1`, so a stop trigger that
/// suppresses step 2 still leads to the final message.
pub fn default_rules() -> Vec<StepRule> {
    vec![
        StepRule {
            step: FunnelStep::First,
            eligible: |user| {
                user.status == UserStatus::Alive
                    && user.last_step_sent == 0
                    && !user.trigger_fired
                    && !user.send_in_progress
            },
        },
        StepRule {
            step: FunnelStep::Second,
            eligible: |user| {
                user.status == UserStatus::Alive
                    && user.last_step_sent == 1
                    && !user.trigger_fired
                    && !user.send_in_progress
            },
        },
        StepRule {
            step: FunnelStep::Third,
            eligible: |user| {
                user.status == UserStatus::Alive
                    && (user.last_step_sent == 1 || user.last_step_sent == 2)
                    && !user.send_in_progress
            },
        },
    ]
}

/// What to do for an eligible step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Step content passed the policy screen; dispatch it.
    Dispatch,
    /// Step content hit a disqualifying keyword; end the funnel without
    /// sending.
    Finish,
}

/// Decide the action for one step, or `None` when the user is not
/// eligible for it.
pub fn plan(
    rule: &StepRule,
    user: &FunnelUser,
    policy: &ContentPolicy,
    step_text: &str,
) -> Option<StepAction> {
    if !(rule.eligible)(user) {
        return None;
    }

    if policy.disqualifies(step_text) {
        Some(StepAction::Finish)
    } else {
        Some(StepAction::Dispatch)
    }
}
