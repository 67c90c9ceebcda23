//! Reconnection backoff for the host service

use std::time::Duration;
use tracing::debug;

/// When (and whether) the service re-issues `connect` on its own
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of retries in a row (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Retries enabled with the default timings
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Exponential backoff state for consecutive failures
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            current: policy.initial_backoff,
            policy,
            attempt: 0,
        }
    }

    /// Delay before the next retry, or `None` when retrying is off or the
    /// attempt cap is used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.enabled {
            return None;
        }
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        self.attempt += 1;
        let delay = self.current;
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.policy.multiplier);
        self.current = next.min(self.policy.max_backoff);

        debug!("Retry {} in {}ms", self.attempt, delay.as_millis());
        Some(delay)
    }

    /// Start over (after a successful connection or an explicit connect)
    pub fn reset(&mut self) {
        self.current = self.policy.initial_backoff;
        self.attempt = 0;
    }

    /// Retries issued since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.enabled
    }
}
