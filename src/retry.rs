//! # Retry: Bounded Attempts and Soft Time Budget
//!
//! Every pool and registry operation follows the same shape: observe outside
//! a transaction, then verify-and-commit inside one. A lost race is not an
//! error, just a wasted attempt. [`RetryPolicy`] runs such an operation up to a
//! fixed ceiling and reports [`Attempt::Exhausted`] when it never succeeds.
//!
//! [`TimeBudget`] bounds the top-level discovery loop. After each step it
//! extrapolates the mean step duration one step ahead and stops once that
//! projection crosses the limit:
//!
//! ```text
//! projected = elapsed / steps * (steps + 1)
//! ```

use crate::error::{DiscoveryError, Result};
use crate::store::StoreError;
use std::time::{Duration, Instant};

/// Attempt ceiling for observe-then-commit operations.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Outcome of one attempt, or of a whole bounded run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Success(T),
    /// Lost a race or found nothing; worth another attempt.
    Conflict,
    /// The ceiling was reached (or the operation gave up early).
    Exhausted,
}

impl<T> Attempt<T> {
    /// Fold a transaction result. `Ok(None)` means the in-transaction
    /// re-verification failed; a store conflict means the commit lost.
    pub fn from_transaction(result: core::result::Result<Option<T>, StoreError>) -> core::result::Result<Self, StoreError> {
        match result {
            Ok(Some(value)) => Ok(Attempt::Success(value)),
            Ok(None) => Ok(Attempt::Conflict),
            Err(e) if e.is_conflict() => Ok(Attempt::Conflict),
            Err(e) => Err(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempt<U> {
        match self {
            Attempt::Success(value) => Attempt::Success(f(value)),
            Attempt::Conflict => Attempt::Conflict,
            Attempt::Exhausted => Attempt::Exhausted,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Attempt::Conflict)
    }

    /// Unwrap a finished run, turning anything but success into `TooManyRetries`.
    pub fn or_too_many_retries(self, operation: &'static str, attempts: u32) -> Result<T> {
        match self {
            Attempt::Success(value) => Ok(value),
            Attempt::Conflict | Attempt::Exhausted => {
                Err(DiscoveryError::TooManyRetries { operation, attempts })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op` (given the 1-based attempt number) until it succeeds, gives up
    /// with `Exhausted`, or the ceiling is reached. Errors abort immediately.
    pub fn run<T, E, F>(&self, mut op: F) -> core::result::Result<Attempt<T>, E>
    where
        F: FnMut(u32) -> core::result::Result<Attempt<T>, E>,
    {
        for attempt in 1..=self.max_attempts {
            match op(attempt)? {
                Attempt::Success(value) => return Ok(Attempt::Success(value)),
                Attempt::Exhausted => return Ok(Attempt::Exhausted),
                Attempt::Conflict => continue,
            }
        }
        Ok(Attempt::Exhausted)
    }

    /// [`run`](Self::run), mapping exhaustion to `TooManyRetries` for `operation`.
    pub fn run_or_fail<T, F>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<Attempt<T>>,
    {
        self.run(op)?
            .or_too_many_retries(operation, self.max_attempts)
    }
}

/// Soft wall-clock budget for a sequence of steps.
#[derive(Debug, Clone)]
pub struct TimeBudget {
    limit: Duration,
    started: Instant,
    steps: u32,
}

impl TimeBudget {
    pub fn start(limit: Duration) -> Self {
        TimeBudget {
            limit,
            started: Instant::now(),
            steps: 0,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Record a finished step. Returns false when one more step is projected
    /// to overrun the limit.
    pub fn record_step(&mut self) -> bool {
        self.steps += 1;
        !projection_exceeds(self.elapsed(), self.steps, self.limit)
    }
}

/// True when `elapsed / steps * (steps + 1)` exceeds `limit`.
pub fn projection_exceeds(elapsed: Duration, steps: u32, limit: Duration) -> bool {
    if steps == 0 {
        return elapsed > limit;
    }
    elapsed / steps * (steps + 1) > limit
}
