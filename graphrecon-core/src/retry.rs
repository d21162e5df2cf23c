//! Bounded fixed-delay retry.

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ErrorInfo};

/// How many times to try, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RetryPolicyConfig")]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(Self {
            max_attempts,
            delay,
        })
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            delay: Self::DEFAULT_DELAY,
        }
    }
}

/// On-disk shape of a retry policy.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryPolicyConfig {
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_delay_secs")]
    delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    RetryPolicy::DEFAULT_MAX_ATTEMPTS
}

fn default_delay_secs() -> u64 {
    RetryPolicy::DEFAULT_DELAY.as_secs()
}

impl TryFrom<RetryPolicyConfig> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(c: RetryPolicyConfig) -> Result<Self, Self::Error> {
        RetryPolicy::new(c.max_attempts, Duration::from_secs(c.delay_secs))
    }
}

/// Result of a retried operation together with how many calls it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, ErrorInfo>,
    pub attempts: u32,
}

/// Runs an operation until it succeeds, fails permanently, or the attempt
/// budget is spent.
pub struct RetryExecutor<C = SystemClock> {
    policy: RetryPolicy,
    clock: C,
}

impl RetryExecutor<SystemClock> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_clock(policy, SystemClock)
    }
}

impl<C: Clock> RetryExecutor<C> {
    pub fn with_clock(policy: RetryPolicy, clock: C) -> Self {
        Self { policy, clock }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Call `op` with the 1-based attempt number until it returns `Ok`, a
    /// non-retryable error, or `max_attempts` calls have been made.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Retried<T>
    where
        F: FnMut(u32) -> Result<T, ErrorInfo>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, "Succeeded after retry");
                    }
                    return Retried {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) if !e.classification.is_retryable() => {
                    warn!(
                        operation,
                        attempt,
                        classification = %e.classification,
                        error = %e,
                        "Not retrying"
                    );
                    return Retried {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
                Err(e) if attempt >= max_attempts => {
                    error!(
                        operation,
                        attempts = attempt,
                        classification = %e.classification,
                        error = %e,
                        "Giving up after {} attempts",
                        attempt
                    );
                    return Retried {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        classification = %e.classification,
                        error = %e,
                        "Attempt failed, retrying in {:?}",
                        self.policy.delay
                    );
                    self.clock.sleep(self.policy.delay);
                    attempt += 1;
                }
            }
        }
    }
}
