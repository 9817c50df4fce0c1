// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retry policy with jittered exponential back-off for model calls.

use std::time::Duration;

use crate::error::CoreError;

/// Controls how transient and rate-limit errors from the backend are
/// retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (cap).
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries — used by tests to keep failures fast.
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Compute the delay before retry number `attempt` (0-indexed).
    ///
    /// A rate-limited error with a provider-supplied delay overrides the
    /// computed backoff (still capped at `max_delay`).
    pub fn delay_for(&self, attempt: u32, error: &CoreError) -> Duration {
        if let CoreError::RateLimited { retry_after: Some(d), .. } = error {
            return (*d).min(self.max_delay);
        }
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        // Add ~25% jitter to prevent synchronized retry storms.
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt + 1 >= self.max_attempts
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
/// Not cryptographically secure — just enough to spread retry storms.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> CoreError {
        CoreError::Transient("503".into())
    }

    #[test]
    fn delay_grows_with_backoff() {
        let p = RetryPolicy::default();
        let d0 = p.delay_for(0, &transient());
        let d1 = p.delay_for(1, &transient());
        let d2 = p.delay_for(2, &transient());
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn delay_capped_at_max() {
        let p = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            backoff_factor: 10.0,
            max_attempts: 20,
        };
        let d = p.delay_for(10, &transient());
        // Must not exceed max_delay + 25% jitter.
        assert!(d <= Duration::from_millis(37_500));
    }

    #[test]
    fn provider_delay_overrides_backoff() {
        let p = RetryPolicy::default();
        let e = CoreError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(p.delay_for(0, &e), Duration::from_secs(7));
    }

    #[test]
    fn provider_delay_still_capped() {
        let p = RetryPolicy { max_delay: Duration::from_secs(5), ..Default::default() };
        let e = CoreError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(p.delay_for(0, &e), Duration::from_secs(5));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let p = RetryPolicy { max_attempts: 3, ..Default::default() };
        assert!(!p.should_give_up(0));
        assert!(!p.should_give_up(1));
        assert!(p.should_give_up(2));
    }

    #[test]
    fn none_policy_never_retries() {
        assert!(RetryPolicy::none().should_give_up(0));
    }
}
