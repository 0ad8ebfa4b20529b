//! Retry decisions with exponential backoff and jitter.
//!
//! A message is retried only for transient failures (transport errors,
//! timeouts, 5xx and 429). The delay grows with the attempt number, is
//! capped, and is randomized by a jitter factor so that many repositories
//! failing against the same host do not retry in lockstep. A 429 with a
//! usable `Retry-After` overrides the computed backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy for webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts are `max_retries + 1`.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for computed backoff delays.
    pub max_delay: Duration,

    /// Upper bound for server-requested `Retry-After` delays.
    pub max_retry_after: Duration,

    /// Jitter fraction (0.0 to 1.0) applied as ± randomization.
    pub jitter_factor: f64,

    /// How delays grow between attempts.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retry_after: Duration::from_secs(600),
            jitter_factor: 0.2,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles with every retry.
    Exponential,
    /// Delay grows by `base_delay` with every retry.
    Linear,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then attempt again.
    Retry {
        /// How long to wait
        delay: Duration,
    },
    /// Stop retrying this message.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retries() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Total attempts allowed, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Decides whether to retry after `attempt_number` (1-based) failed.
    pub fn decide(&self, attempt_number: u32, error: &DeliveryError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }

        if attempt_number >= self.max_attempts() {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.max_attempts()),
            };
        }

        let delay = match error.retry_after_seconds() {
            Some(seconds) => Duration::from_secs(seconds).min(self.max_retry_after),
            None => self.backoff_delay(attempt_number),
        };

        RetryDecision::Retry { delay }
    }

    /// Jittered backoff before the retry that follows `attempt_number`.
    pub fn backoff_delay(&self, attempt_number: u32) -> Duration {
        let capped = self.base_backoff(attempt_number).min(self.max_delay);
        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }

    fn base_backoff(&self, attempt_number: u32) -> Duration {
        let step = attempt_number.max(1);
        match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(step),
            BackoffStrategy::Exponential => {
                let exponent = (step - 1).min(20);
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        }
    }
}

/// Randomizes a delay by ±`jitter_factor`.
///
/// With a factor of 0.2 a 10s delay becomes anything from 8s to 12s.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..Default::default() }
    }

    fn delay_of(decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::Retry { delay } => delay,
            RetryDecision::GiveUp { reason } => panic!("expected retry, gave up: {reason}"),
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = no_jitter();
        let delays: Vec<_> = (1..=5)
            .map(|attempt| delay_of(policy.decide(attempt, &DeliveryError::timeout(5))))
            .collect();

        assert_eq!(
            delays,
            [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec(),
        );
    }

    #[test]
    fn default_allows_five_retries() {
        let policy = no_jitter();
        assert_eq!(policy.max_attempts(), 6);
        assert!(matches!(policy.decide(5, &DeliveryError::network("reset")), RetryDecision::Retry { .. }));

        match policy.decide(6, &DeliveryError::network("reset")) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("sixth failure must be final"),
        }
    }

    #[test]
    fn client_errors_are_never_retried() {
        let decision = no_jitter().decide(1, &DeliveryError::client_error(404, "no_service"));
        assert!(matches!(decision, RetryDecision::GiveUp { reason } if reason.contains("non-retryable")));
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let policy = no_jitter();
        let delay = delay_of(policy.decide(3, &DeliveryError::rate_limited(Some(7))));
        assert_eq!(delay, Duration::from_secs(7));
    }

    #[test]
    fn retry_after_is_capped() {
        let policy = RetryPolicy { max_retry_after: Duration::from_secs(30), ..no_jitter() };
        let delay = delay_of(policy.decide(1, &DeliveryError::rate_limited(Some(86_400))));
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn rate_limit_without_hint_uses_backoff() {
        let delay = delay_of(no_jitter().decide(2, &DeliveryError::rate_limited(None)));
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn max_delay_enforced() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(10), max_retries: 50, ..no_jitter() };
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let jittered = apply_jitter(Duration::from_secs(10), 0.5);
            assert!(jittered >= Duration::from_secs(5));
            assert!(jittered <= Duration::from_secs(15));
            seen.insert(jittered.as_millis());
        }
        assert!(seen.len() > 1, "jitter should create variation");
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let linear = RetryPolicy { backoff_strategy: BackoffStrategy::Linear, ..no_jitter() };
        assert_eq!(linear.backoff_delay(3), Duration::from_secs(3));

        let fixed = RetryPolicy { backoff_strategy: BackoffStrategy::Fixed, ..no_jitter() };
        assert_eq!(fixed.backoff_delay(9), Duration::from_secs(1));
    }

    #[test]
    fn no_retries_policy_gives_up_immediately() {
        let decision = RetryPolicy::no_retries().decide(1, &DeliveryError::server_error(500, ""));
        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
    }
}
