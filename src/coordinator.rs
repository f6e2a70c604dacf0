//! # Discovery Coordinator
//!
//! Drives the distributed sieve. Every request for a prime runs a bounded
//! sequence of *steps*; each step claims one registry record round-robin and
//! does that record's share of the work:
//!
//! ```text
//! claim_next ─┬─ sentinel ── pop smallest candidate ─┬─ empty: replenish pool, no result
//!             │                                      └─ n: create record n ── maintain(n)
//!             └─ prime p ──────────────────────────────────────────────────── maintain(p)
//!
//! maintain(p):  bound = frontier()
//!               2p > bound  → grow: insert bound+1 ..= bound+min(2p-bound, chunk)
//!               otherwise   → sieve: remove 2p, 3p, … while < bound
//! ```
//!
//! Popping the sentinel only yields a prime once every smaller prime has
//! crossed its multiples out of the region below the frontier, which is what
//! the round-robin rotation guarantees over time. The pool's current maximum
//! serves as the frontier; sieving stops strictly below it, so it only moves
//! when the pool grows or its maximum is popped.

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::namespace::Namespaces;
use crate::pool::CandidatePool;
use crate::prom_metrics::Metrics;
use crate::registry::{PrimeRecord, PrimeRegistry};
use crate::retry::TimeBudget;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct DiscoveryCoordinator<S> {
    pool: CandidatePool<S>,
    registry: PrimeRegistry<S>,
    config: DiscoveryConfig,
    metrics: Arc<Metrics>,
}

impl<S: Store + Clone> DiscoveryCoordinator<S> {
    /// Build a coordinator over `store`, creating the namespace anchors.
    /// Fails with `InvalidConfig` before touching the store if `config` does
    /// not validate.
    pub fn new(store: S, config: DiscoveryConfig, metrics: Arc<Metrics>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| DiscoveryError::InvalidConfig(e.to_string()))?;
        Namespaces::from_config(&config).anchor(&store)?;
        let retry = config.retry_policy();
        Ok(DiscoveryCoordinator {
            pool: CandidatePool::new(store.clone(), &config.sieve_namespace, retry, metrics.clone()),
            registry: PrimeRegistry::new(store, &config.prime_namespace, retry, metrics.clone()),
            config,
            metrics,
        })
    }
}

impl<S: Store> DiscoveryCoordinator<S> {
    pub fn pool(&self) -> &CandidatePool<S> {
        &self.pool
    }

    pub fn registry(&self) -> &PrimeRegistry<S> {
        &self.registry
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run steps until one mints a new prime or the time budget is spent.
    ///
    /// `Ok(None)` means the budget ran out; retry later. `TooManyRetries`
    /// from any step aborts the call.
    pub fn discover_prime(&self) -> Result<Option<PrimeRecord>> {
        let result = run_budgeted(self.config.time_limit(), || self.step());
        match &result {
            Ok(None) => {
                self.metrics.budget_expired.inc();
                debug!(limit_ms = self.config.time_limit_ms, "time budget exhausted without a discovery");
            }
            Err(DiscoveryError::TooManyRetries { operation, attempts }) => {
                self.metrics.record_exhausted(operation);
                warn!(operation, attempts, "discovery aborted by contention");
            }
            Err(e) => warn!(error = %e, "discovery step failed"),
            Ok(Some(_)) => {}
        }
        result
    }

    /// One unit of cooperative work. Returns the record minted by this step,
    /// if any.
    pub fn step(&self) -> Result<Option<PrimeRecord>> {
        self.metrics.steps.inc();
        let claimed = self.registry.claim_next()?;
        if !claimed.is_sentinel() {
            self.maintain(claimed.number)?;
            return Ok(None);
        }

        let Some(seed) = self.pool.pop_smallest()? else {
            self.replenish()?;
            return Ok(None);
        };
        let created = self.registry.create(seed, None)?;
        self.maintain(seed)?;
        match &created {
            Some(record) => {
                self.metrics.primes_discovered.inc();
                info!(number = record.number, "prime discovered");
            }
            None => debug!(number = seed, "popped number already registered"),
        }
        Ok(created)
    }

    /// Refill an empty pool: the initial range on a fresh registry, otherwise
    /// the chunk just above the largest known prime.
    fn replenish(&self) -> Result<()> {
        let chunk = self.config.chunk_size;
        match self.registry.largest_prime()? {
            None => {
                if self.pool.initialize_range(chunk)? {
                    info!(chunk, "candidate pool initialized");
                }
            }
            Some(largest) => {
                let added = self.pool.extend(largest.saturating_add(1), chunk)?;
                debug!(largest, added, "candidate pool reseeded");
            }
        }
        Ok(())
    }

    /// Highest number the sieve has reached: the pool's maximum, or the
    /// largest prime when the pool is empty.
    fn frontier(&self) -> Result<u64> {
        if let Some(max) = self.pool.max_number()? {
            return Ok(max);
        }
        Ok(self.registry.largest_prime()?.unwrap_or(0))
    }

    /// Grow the pool towards `2p`, or cross out multiples of `p` below the
    /// frontier.
    ///
    /// A region below frontier `B` is settled once every registered prime
    /// `p` with `p * p < B` has been maintained against `B`. Growth leaves the
    /// band it adds unsettled until the rotation comes back round.
    pub fn maintain(&self, p: u64) -> Result<()> {
        if p < 2 {
            return Ok(());
        }
        let first_multiple = p.saturating_mul(2);
        let bound = self.frontier()?;

        if first_multiple > bound {
            let grow = (first_multiple - bound).min(self.config.chunk_size);
            let added = self.pool.extend(bound + 1, grow)?;
            debug!(prime = p, bound, grow, added, "pool grown");
            return Ok(());
        }

        let mut removed = 0u64;
        let mut multiple = first_multiple;
        while multiple < bound {
            if self.pool.remove_if_present(multiple)? {
                removed += 1;
            }
            multiple = match multiple.checked_add(p) {
                Some(next) => next,
                None => break,
            };
        }
        debug!(prime = p, bound, removed, "multiples sieved");
        Ok(())
    }

    pub fn assign_owner(&self, record: &PrimeRecord, owner: &str) -> Result<bool> {
        self.registry.assign_owner(record, owner)
    }

    /// Up to `limit` largest primes with their owners, descending.
    pub fn list_top_primes(&self, limit: usize) -> Result<Vec<(u64, Option<String>)>> {
        Ok(self
            .registry
            .list_top(limit)?
            .into_iter()
            .map(|r| (r.number, r.owner))
            .collect())
    }

    pub fn list_primes_for_owner(&self, owner: &str) -> Result<Vec<u64>> {
        self.registry.list_for_owner(owner)
    }
}

/// Run `step` until it yields a value, fails, or the projected duration of
/// one more step would overrun `limit`.
pub(crate) fn run_budgeted<T>(limit: Duration, mut step: impl FnMut() -> Result<Option<T>>) -> Result<Option<T>> {
    let mut budget = TimeBudget::start(limit);
    loop {
        if let Some(value) = step()? {
            return Ok(Some(value));
        }
        if !budget.record_step() {
            debug!(steps = budget.steps(), elapsed_ms = budget.elapsed().as_millis() as u64, "budget spent");
            return Ok(None);
        }
    }
}
