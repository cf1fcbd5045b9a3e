//! Bounded retry with exponential backoff.
//!
//! Used for storage contention on the append path and for slot persistence.
//! Sleeping goes through the injected [`Clock`], so schedules are testable
//! without real delays.

use crate::clock::Clock;
use mnemo_types::config::RetryConfig;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on each further failure.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        /// The successful result.
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// The operation failed for good.
    Exhausted {
        /// The error from the last attempt.
        last_error: E,
        /// Total number of attempts made.
        attempts: u32,
    },
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

impl RetryPolicy {
    /// Build from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay after the failure of attempt `attempt` (0-indexed):
    /// `min(base * 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Every delay the policy would wait if all attempts failed.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_for(attempt))
            .collect()
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts run out.
    pub fn run<T, E, F, P>(&self, clock: &dyn Clock, mut operation: F, should_retry: P) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "retry succeeded");
                    }
                    return RetryOutcome::Success {
                        result,
                        attempts: attempt + 1,
                    };
                }
                Err(err) => {
                    if !should_retry(&err) {
                        return RetryOutcome::Exhausted {
                            last_error: err,
                            attempts: attempt + 1,
                        };
                    }
                    if attempt + 1 >= max {
                        warn!(attempts = max, error = %err, "all retry attempts exhausted");
                        return RetryOutcome::Exhausted {
                            last_error: err,
                            attempts: attempt + 1,
                        };
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient error"
                    );
                    clock.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
