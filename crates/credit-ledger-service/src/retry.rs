//! Bounded retry for optimistic concurrency conflicts.

use std::time::Duration;

use credit_ledger_core::{Deadline, LedgerError, Result};

use crate::config::LedgerConfig;

/// Outcome of one optimistic attempt.
#[derive(Debug)]
pub(crate) enum Attempt<T> {
    /// The attempt committed (or was an idempotent no-op).
    Done(T),
    /// Another writer won the race; re-read and try again.
    Conflict,
}

/// Retry budget and backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff after the first conflict.
    pub backoff_base: Duration,
    /// Upper bound for a single backoff.
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Build the policy from ledger configuration.
    #[must_use]
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            backoff_base: config.retry_backoff_base,
            backoff_max: config.retry_backoff_max,
        }
    }

    /// Backoff before attempt `attempt + 1`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Run `op` until it is done, fails, or the budget or deadline runs out.
    pub(crate) fn run<T>(
        &self,
        operation: &'static str,
        deadline: Deadline,
        mut op: impl FnMut() -> Result<Attempt<T>>,
    ) -> Result<T> {
        for attempt in 1..=self.max_attempts {
            if deadline.is_expired() {
                return Err(LedgerError::DeadlineExceeded);
            }
            match op()? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Conflict if attempt < self.max_attempts => {
                    let mut pause = self.backoff(attempt);
                    if let Some(remaining) = deadline.remaining() {
                        pause = pause.min(remaining);
                    }
                    tracing::debug!(
                        operation,
                        attempt,
                        backoff_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX),
                        "Version conflict, retrying"
                    );
                    std::thread::sleep(pause);
                }
                Attempt::Conflict => {}
            }
        }

        tracing::warn!(
            operation,
            attempts = self.max_attempts,
            "Retries exhausted on version conflicts"
        );
        Err(LedgerError::ConcurrencyConflict {
            attempts: self.max_attempts,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}
