//! Per-step retry bookkeeping and the failure transition rule.

use crate::core::types::{ErrorClass, StepOutcome};

/// Ephemeral retry state for the step currently executing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Retries consumed so far (0 on the first attempt).
    pub attempt: u32,
    pub succeeded: bool,
}

/// What to do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Ask the fixer for a corrected step and try again.
    Heal,
    /// Stop retrying; the step ends in the given terminal state.
    GiveUp(StepOutcome),
}

/// Decide the transition for a failed attempt.
///
/// - non-retryable errors give up immediately, without healing;
/// - disabled auto-retry or an exhausted budget gives up as exhausted;
/// - otherwise heal.
pub fn decide(
    class: ErrorClass,
    state: RetryState,
    max_retries: u32,
    auto_retry: bool,
) -> RetryDecision {
    if class == ErrorClass::NonRetryable {
        return RetryDecision::GiveUp(StepOutcome::NonRetryableFailure);
    }
    if !auto_retry || state.attempt >= max_retries {
        return RetryDecision::GiveUp(StepOutcome::RetryExhausted);
    }
    RetryDecision::Heal
}
