//! Error taxonomy for discovery operations.
//!
//! - Store conflicts never escape a [`RetryPolicy`](crate::retry::RetryPolicy);
//!   they are retried until the attempt ceiling.
//! - [`DiscoveryError::TooManyRetries`] means contention outlasted the ceiling.
//!   It is a fault for the step that raised it, not an "empty" answer.
//! - Absent records (already-removed candidates, vanished claims) are not
//!   errors at all; they surface as `Option`/`bool` results.
//! - An exhausted time budget is reported as `Ok(None)` from
//!   [`discover_prime`](crate::coordinator::DiscoveryCoordinator::discover_prime).

use crate::store::StoreError;

pub type Result<T> = core::result::Result<T, DiscoveryError>;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Optimistic-concurrency contention exceeded the attempt ceiling.
    #[error("{operation} gave up after {attempts} attempts")]
    TooManyRetries {
        operation: &'static str,
        attempts: u32,
    },

    /// The configuration cannot drive discovery (e.g. an empty initial range).
    #[error("invalid discovery configuration: {0}")]
    InvalidConfig(String),

    /// A non-retryable storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DiscoveryError {
    pub fn is_too_many_retries(&self) -> bool {
        matches!(self, DiscoveryError::TooManyRetries { .. })
    }
}
