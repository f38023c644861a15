//! Retry policy with exponential backoff, as an explicit state machine.
//!
//! A [`RetryState`] is created per delivery. Each failure is fed to
//! [`RetryState::record_failure`], which returns either the delay before the
//! next attempt or the terminal give-up transition.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for every further retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            attempts: 0,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Sleep `delay`, then make another attempt.
    Retry { delay: Duration },
    /// Stop; `attempts` deliveries were made.
    GiveUp { attempts: u32 },
}

/// Retry bookkeeping for one delivery.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    /// Attempts made so far. Also the `attempt` value carried by the next
    /// delivery copy.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt and decide the next step.
    ///
    /// Non-retryable errors give up immediately; retryable ones give up once
    /// the budget is spent.
    pub fn record_failure(&mut self, error: &DeliveryError) -> RetryStep {
        self.attempts += 1;
        if !error.is_retryable() || self.attempts >= self.policy.max_attempts.max(1) {
            return RetryStep::GiveUp {
                attempts: self.attempts,
            };
        }
        RetryStep::Retry {
            delay: self.policy.delay_for(self.attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
    }

    fn transient() -> DeliveryError {
        DeliveryError::Transient("503".into())
    }

    #[test]
    fn delays_double_and_cap() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let p = RetryPolicy {
            jitter: true,
            ..policy()
        };
        for _ in 0..100 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn transient_failures_exhaust_budget() {
        let mut state = policy().with_max_attempts(3).start();
        assert_eq!(state.attempts(), 0);
        assert_eq!(
            state.record_failure(&transient()),
            RetryStep::Retry { delay: Duration::from_millis(100) }
        );
        assert_eq!(
            state.record_failure(&transient()),
            RetryStep::Retry { delay: Duration::from_millis(200) }
        );
        assert_eq!(
            state.record_failure(&transient()),
            RetryStep::GiveUp { attempts: 3 }
        );
    }

    #[test]
    fn permanent_failure_gives_up_at_once() {
        let mut state = policy().start();
        let step = state.record_failure(&DeliveryError::Permanent("bad payload".into()));
        assert_eq!(step, RetryStep::GiveUp { attempts: 1 });
    }

    #[test]
    fn timeout_counts_against_budget() {
        let mut state = policy().with_max_attempts(2).start();
        let timeout = DeliveryError::Timeout(Duration::from_secs(1));
        assert!(matches!(state.record_failure(&timeout), RetryStep::Retry { .. }));
        assert_eq!(state.record_failure(&timeout), RetryStep::GiveUp { attempts: 2 });
    }

    #[test]
    fn zero_budget_still_allows_one_attempt() {
        let mut state = policy().with_max_attempts(0).start();
        assert_eq!(state.record_failure(&transient()), RetryStep::GiveUp { attempts: 1 });
    }
}
