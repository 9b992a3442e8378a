//! Retry and catch policy evaluation

use crate::models::execution::ErrorInfo;
use crate::workflow::machine::{Catcher, Retrier};
use rand::Rng;
use std::time::Duration;

/// What to do with a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FailureAction {
    /// Invoke the state again after the delay
    Retry { delay: Duration },
    /// Route to a catch target
    Catch { catcher_index: usize },
    /// Fail the enclosing branch
    Propagate,
}

impl Retrier {
    /// Delay after the `attempt`-th failed invocation (1-based).
    ///
    /// `base * multiplier^(attempt-1)`, capped by the retrier's own limit and
    /// by `global_cap`.
    pub fn delay_after(&self, attempt: u32, global_cap: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut seconds = self.backoff_base.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !seconds.is_finite() {
            seconds = f64::MAX;
        }
        for cap in [self.max_backoff, global_cap].into_iter().flatten() {
            seconds = seconds.min(cap.as_secs_f64());
        }
        if self.jitter && seconds > 0.0 {
            seconds = rand::thread_rng().gen_range(0.0..=seconds);
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

/// Decide how to handle `error` after `attempts` invocations of the state
pub fn decide(
    error: &ErrorInfo,
    attempts: u32,
    retriers: &[Retrier],
    catchers: &[Catcher],
    global_cap: Option<Duration>,
) -> FailureAction {
    // First matching retrier owns the error; the rest are not consulted
    if let Some(retrier) = retriers.iter().find(|r| r.matcher.matches(&error.error)) {
        if attempts < retrier.max_attempts {
            return FailureAction::Retry {
                delay: retrier.delay_after(attempts, global_cap),
            };
        }
    }

    match catchers.iter().position(|c| c.matcher.matches(&error.error)) {
        Some(catcher_index) => FailureAction::Catch { catcher_index },
        None => FailureAction::Propagate,
    }
}
