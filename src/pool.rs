//! # Candidate Pool
//!
//! The shared set of not-yet-eliminated integers: a distributed sieve of
//! Eratosthenes. Every candidate lives in the sieve entity group under
//! `key_<n>`, so an integer is present at most once. Numbers are inserted as
//! the frontier grows, crossed out when a claimed prime sieves them, and
//! popped from the bottom when the sentinel is claimed.
//!
//! Mutations that must observe-then-act (`pop_smallest`, `remove_if_present`,
//! `initialize_range`) run inside a single-group transaction and retry on
//! conflict; plain insertion is an atomic create-if-absent.

use crate::error::Result;
use crate::prom_metrics::Metrics;
use crate::retry::{Attempt, RetryPolicy};
use crate::store::{Direction, Entity, Key, Query, Store};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Entity kind for sieve candidates.
pub const CANDIDATE_KIND: &str = "Sieve";

/// Smallest candidate ever placed in the pool.
pub const FIRST_CANDIDATE: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub number: u64,
}

pub struct CandidatePool<S> {
    store: S,
    group: String,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl<S: Store> CandidatePool<S> {
    pub fn new(store: S, group: impl Into<String>, retry: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        CandidatePool {
            store,
            group: group.into(),
            retry,
            metrics,
        }
    }

    fn key(&self, number: u64) -> Key {
        Key::numeric(CANDIDATE_KIND, &self.group, number)
    }

    fn entity(&self, number: u64) -> Result<Entity> {
        Ok(Entity::from_record(self.key(number), &Candidate { number })?)
    }

    fn ordered(&self, direction: Direction) -> Query {
        Query::new(CANDIDATE_KIND, &self.group).order_by("number", direction)
    }

    /// Remove and return the smallest candidate, or `None` when the pool is
    /// empty. A candidate is handed to at most one caller.
    pub fn pop_smallest(&self) -> Result<Option<u64>> {
        self.retry.run_or_fail("pop_smallest", |attempt| {
            let smallest = self.store.query(&self.ordered(Direction::Ascending).limit(1))?;
            let Some(entity) = smallest.into_iter().next() else {
                return Ok(Attempt::Success(None));
            };
            let candidate: Candidate = entity.decode()?;
            let key = entity.key;
            let outcome = Attempt::from_transaction(self.store.run_in_transaction(&self.group, |txn| {
                // Already popped or sieved by someone else.
                if txn.get(&key)?.is_none() {
                    return Ok(None);
                }
                txn.delete(&key)?;
                Ok(Some(candidate.number))
            }))?;
            if outcome.is_conflict() {
                self.metrics.record_conflict("pop_smallest");
                debug!(attempt, number = candidate.number, "pop lost race");
            }
            Ok(outcome.map(Some))
        })
    }

    /// Largest candidate currently present. Read outside any transaction.
    pub fn max_number(&self) -> Result<Option<u64>> {
        match self.store.query(&self.ordered(Direction::Descending).limit(1))?.first() {
            Some(entity) => Ok(Some(entity.decode::<Candidate>()?.number)),
            None => Ok(None),
        }
    }

    /// Insert `number` unless it is already present. Returns true when this
    /// call inserted it.
    pub fn ensure(&self, number: u64) -> Result<bool> {
        let inserted = self.store.create_if_absent(self.entity(number)?)?;
        if inserted {
            self.metrics.candidates_added.inc();
        }
        Ok(inserted)
    }

    /// Delete `number` if present. Returns whether this call removed it.
    pub fn remove_if_present(&self, number: u64) -> Result<bool> {
        let key = self.key(number);
        let removed = self.retry.run_or_fail("remove_if_present", |attempt| {
            let outcome = Attempt::from_transaction(self.store.run_in_transaction(&self.group, |txn| {
                if txn.get(&key)?.is_none() {
                    return Ok(Some(false));
                }
                txn.delete(&key)?;
                Ok(Some(true))
            }))?;
            if outcome.is_conflict() {
                self.metrics.record_conflict("remove_if_present");
                debug!(attempt, number, "remove lost race");
            }
            Ok(outcome)
        })?;
        if removed {
            self.metrics.candidates_removed.inc();
        }
        Ok(removed)
    }

    /// Populate an empty pool with `2..chunk`. Returns false, without writing
    /// anything, if the range is empty or the pool turns out to be non-empty
    /// by the time the transaction runs.
    pub fn initialize_range(&self, chunk: u64) -> Result<bool> {
        let numbers: Vec<u64> = (FIRST_CANDIDATE..chunk).collect();
        if numbers.is_empty() {
            debug!(chunk, "initial range is empty, nothing to insert");
            return Ok(false);
        }
        let initialized = self.retry.run_or_fail("initialize_range", |attempt| {
            let outcome = Attempt::from_transaction(self.store.run_in_transaction(&self.group, |txn| {
                if !txn.query(&Query::new(CANDIDATE_KIND, &self.group).limit(1))?.is_empty() {
                    return Ok(Some(false));
                }
                for &n in &numbers {
                    txn.put(Entity::from_record(self.key(n), &Candidate { number: n })?)?;
                }
                Ok(Some(true))
            }))?;
            if outcome.is_conflict() {
                self.metrics.record_conflict("initialize_range");
                debug!(attempt, chunk, "initialization lost race");
            }
            Ok(outcome)
        })?;
        if initialized {
            self.metrics.candidates_added.inc_by(numbers.len() as u64);
            debug!(first = FIRST_CANDIDATE, last = chunk.saturating_sub(1), "pool initialized");
        }
        Ok(initialized)
    }

    /// Insert `start..start + count`, skipping numbers already present.
    /// Returns how many this call inserted.
    pub fn extend(&self, start: u64, count: u64) -> Result<u64> {
        let mut inserted = 0;
        for number in start..start.saturating_add(count) {
            if self.ensure(number)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// All candidates in ascending order.
    pub fn snapshot(&self) -> Result<Vec<u64>> {
        let mut numbers = Vec::new();
        for entity in self.store.query(&self.ordered(Direction::Ascending))? {
            numbers.push(entity.decode::<Candidate>()?.number);
        }
        Ok(numbers)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.store.query(&Query::new(CANDIDATE_KIND, &self.group).limit(1))?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{StoreError, Transaction};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Deletes the first row of the next query result right after returning
    /// it, simulating a caller that wins the race in between.
    #[derive(Default)]
    struct RacingStore {
        inner: MemoryStore,
        armed: AtomicBool,
    }

    impl Store for RacingStore {
        fn get(&self, key: &Key) -> core::result::Result<Option<Entity>, StoreError> {
            self.inner.get(key)
        }
        fn put(&self, entity: Entity) -> core::result::Result<(), StoreError> {
            self.inner.put(entity)
        }
        fn delete(&self, key: &Key) -> core::result::Result<(), StoreError> {
            self.inner.delete(key)
        }
        fn query(&self, query: &Query) -> core::result::Result<Vec<Entity>, StoreError> {
            let rows = self.inner.query(query)?;
            if self.armed.swap(false, Ordering::SeqCst) {
                if let Some(first) = rows.first() {
                    self.inner.delete(&first.key)?;
                }
            }
            Ok(rows)
        }
        fn create_if_absent(&self, entity: Entity) -> core::result::Result<bool, StoreError> {
            self.inner.create_if_absent(entity)
        }
        fn run_in_transaction<T, F>(&self, group: &str, f: F) -> core::result::Result<T, StoreError>
        where
            F: FnOnce(&mut dyn Transaction) -> core::result::Result<T, StoreError>,
        {
            self.inner.run_in_transaction(group, f)
        }
    }

    fn pool() -> (Arc<MemoryStore>, CandidatePool<Arc<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new());
        let pool = CandidatePool::new(store.clone(), "sieve", RetryPolicy::default(), Arc::new(Metrics::new()));
        (store, pool)
    }

    #[test]
    fn pop_on_empty_pool_is_none() {
        let (_, pool) = pool();
        assert_eq!(pool.pop_smallest().unwrap(), None);
        assert_eq!(pool.max_number().unwrap(), None);
        assert!(pool.is_empty().unwrap());
    }

    #[test]
    fn pop_returns_numeric_minimum() {
        let (_, pool) = pool();
        for n in [10, 3, 7, 100] {
            pool.ensure(n).unwrap();
        }
        assert_eq!(pool.pop_smallest().unwrap(), Some(3));
        assert_eq!(pool.pop_smallest().unwrap(), Some(7));
        assert_eq!(pool.snapshot().unwrap(), vec![10, 100]);
        assert_eq!(pool.max_number().unwrap(), Some(100));
    }

    #[test]
    fn ensure_is_idempotent() {
        let (store, pool) = pool();
        assert!(pool.ensure(5).unwrap());
        assert!(!pool.ensure(5).unwrap());
        assert_eq!(store.count(CANDIDATE_KIND, "sieve"), 1);
    }

    #[test]
    fn remove_if_present_reports_absence() {
        let (_, pool) = pool();
        pool.ensure(9).unwrap();
        assert!(pool.remove_if_present(9).unwrap());
        assert!(!pool.remove_if_present(9).unwrap());
        assert!(!pool.remove_if_present(11).unwrap());
    }

    #[test]
    fn initialize_range_fills_two_to_chunk() {
        let (_, pool) = pool();
        assert!(pool.initialize_range(100).unwrap());
        let all = pool.snapshot().unwrap();
        assert_eq!(all.len(), 98);
        assert_eq!(all.first(), Some(&2));
        assert_eq!(all.last(), Some(&99));
    }

    #[test]
    fn initialize_range_with_empty_range_inserts_nothing() {
        let (store, pool) = pool();
        let metrics_before = pool.metrics.candidates_added.get();
        assert!(!pool.initialize_range(2).unwrap());
        assert!(!pool.initialize_range(0).unwrap());
        assert!(pool.is_empty().unwrap());
        assert_eq!(store.group_version("sieve"), 0);
        assert_eq!(pool.metrics.candidates_added.get(), metrics_before);
    }

    #[test]
    fn initialize_range_skips_non_empty_pool() {
        let (_, pool) = pool();
        pool.ensure(500).unwrap();
        assert!(!pool.initialize_range(100).unwrap());
        assert_eq!(pool.snapshot().unwrap(), vec![500]);
    }

    #[test]
    fn extend_skips_present_numbers() {
        let (_, pool) = pool();
        pool.ensure(12).unwrap();
        assert_eq!(pool.extend(10, 5).unwrap(), 4);
        assert_eq!(pool.snapshot().unwrap(), vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn pop_retries_when_smallest_vanishes() {
        let store = Arc::new(RacingStore::default());
        let metrics = Arc::new(Metrics::new());
        let pool = CandidatePool::new(store.clone(), "sieve", RetryPolicy::default(), metrics.clone());
        pool.ensure(2).unwrap();
        pool.ensure(3).unwrap();
        store.armed.store(true, Ordering::SeqCst);
        // 2 is observed, then taken by a racer before our transaction.
        assert_eq!(pool.pop_smallest().unwrap(), Some(3));
        assert!(pool.is_empty().unwrap());
        assert_eq!(metrics.conflicts_for("pop_smallest"), 1);
    }

    #[test]
    fn operations_count_metrics() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let pool = CandidatePool::new(store, "sieve", RetryPolicy::default(), metrics.clone());
        pool.initialize_range(10).unwrap();
        pool.remove_if_present(4).unwrap();
        pool.remove_if_present(6).unwrap();
        assert_eq!(metrics.candidates_added.get(), 8);
        assert_eq!(metrics.candidates_removed.get(), 2);
    }
}
