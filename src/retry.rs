//! Bounded exponential backoff for per-event publish retries.
//!
//! A [`RetryPolicy`] is plain configuration. Every event gets its own
//! [`Backoff`] state machine from [`RetryPolicy::backoff`], so one event's
//! retries never influence another's delays.
//!
//! ```text
//! delay(1) = initial_delay
//! delay(n) = min(delay(n - 1) * multiplier, max_delay)
//! ```
//!
//! After `max_retries` delays have been handed out the backoff is exhausted
//! and the sink gives up on the event.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry ceiling and delay curve for retryable publish failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` means a single attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Fresh backoff state for a single event.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            retries: 0,
            current_delay: self.initial_delay.min(self.max_delay),
        }
    }
}

/// Per-event backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
    current_delay: Duration,
}

impl Backoff {
    /// Number of delays handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn exhausted(&self) -> bool {
        self.retries >= self.policy.max_retries
    }

    /// Delay to wait before the next retry, or `None` once the ceiling is hit.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        self.retries += 1;

        let delay = self.current_delay;
        let next = self.current_delay.as_secs_f64() * self.policy.multiplier;
        self.current_delay = Duration::try_from_secs_f64(next)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay);

        Some(delay)
    }
}
