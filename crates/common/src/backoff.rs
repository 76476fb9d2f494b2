//! Bounded exponential backoff
//!
//! Failed renewals and dropped store subscriptions are retried after a delay
//! that grows geometrically from `initial` and never exceeds `max`. A small
//! random jitter spreads retries of many zones that failed together.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Retry delay policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any delay, jitter included
    pub max: Duration,
    /// Growth factor between consecutive attempts
    pub multiplier: f64,
    /// Relative jitter in `[0, 1)`; 0.1 means ±10%
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(3600),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy without jitter
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Set the relative jitter, clamped to `[0, 0.99]`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// Deterministic delay for the given 1-based attempt number
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.initial.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay for the given attempt with jitter applied, never above `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }

        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let secs = (base.as_secs_f64() * (1.0 + spread)).max(0.0);
        let delay = Duration::from_secs_f64(secs).min(self.max);

        trace!(
            attempt = attempt,
            base_ms = base.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            "Computed backoff delay"
        );
        delay
    }
}

/// Stateful attempt counter over a [`BackoffPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    /// Create a tracker with no recorded failures
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.policy.delay(self.attempts)
    }

    /// Number of consecutive failures recorded
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget recorded failures after a success
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// The underlying policy
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
