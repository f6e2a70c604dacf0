//! Property-based tests for the discovery protocol.
//!
//! These tests use the `proptest` framework to check invariants of the pool,
//! the registry, and the step algorithm across randomly generated inputs.
//! Everything runs against the in-process store.
//!
//! # Prerequisites
//!
//! - No database or network access required.
//!
//! # How to run
//!
//! ```bash
//! # Run all property tests:
//! cargo test --test property_tests
//!
//! # Increase case count for thorough testing (default is 256):
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! # Testing strategy
//!
//! - **Pool**: idempotent `ensure`/`remove_if_present`.
//! - **Step**: a claimed prime crosses out exactly its multiples below the
//!   frontier, or grows the pool by the capped amount.
//! - **End to end**: sequential discovery yields the primes in order for any
//!   chunk size.
//! - **Settled sieve**: once every prime `p` with `p * p < B` has been
//!   maintained against frontier `B`, no candidate below `B` is a multiple of
//!   a registered prime, and nothing that isn't got crossed out.
//! - **Registry**: top-N listing is the descending prefix of all primes.
//! - **Budget**: the projection never lets a run pass its limit by more than
//!   one mean step.
//!
//! Each property is named `prop_<subject>_<invariant>`.

mod common;

use primeshare::pool::CandidatePool;
use primeshare::prom_metrics::Metrics;
use primeshare::registry::PrimeRegistry;
use primeshare::retry::{projection_exceeds, RetryPolicy};
use primeshare::store::memory::MemoryStore;
use primeshare::DiscoveryConfig;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn pool() -> CandidatePool<Arc<MemoryStore>> {
    CandidatePool::new(Arc::new(MemoryStore::new()), "sieve", RetryPolicy::default(), Arc::new(Metrics::new()))
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Ensure(u64),
    Remove(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(2u64..60).prop_map(Op::Ensure), (2u64..60).prop_map(Op::Remove)]
}

fn apply(pool: &CandidatePool<Arc<MemoryStore>>, op: Op) {
    match op {
        Op::Ensure(n) => {
            pool.ensure(n).unwrap();
        }
        Op::Remove(n) => {
            pool.remove_if_present(n).unwrap();
        }
    }
}

// == Pool Properties ===========================================================

proptest! {
    /// Applying every maintenance operation twice leaves the same pool as
    /// applying it once.
    #[test]
    fn prop_pool_maintenance_is_idempotent(ops in prop::collection::vec(op(), 0..40)) {
        let once = pool();
        let twice = pool();
        let mut model = BTreeSet::new();
        for &op in &ops {
            apply(&once, op);
            apply(&twice, op);
            apply(&twice, op);
            match op {
                Op::Ensure(n) => { model.insert(n); }
                Op::Remove(n) => { model.remove(&n); }
            }
        }
        prop_assert_eq!(once.snapshot().unwrap(), twice.snapshot().unwrap());
        prop_assert_eq!(once.snapshot().unwrap(), model.into_iter().collect::<Vec<_>>());
    }
}

// == Step Properties ===========================================================

proptest! {
    /// One step on prime `p` over a freshly initialized pool `2..chunk`.
    ///
    /// With `bound = chunk - 1`: if `2p <= bound` the pool loses exactly the
    /// multiples `2p, 3p, ...` strictly below `bound`; otherwise it gains
    /// `bound+1 ..= bound + min(2p - bound, chunk)`.
    #[test]
    fn prop_step_sieves_or_grows(p in 2u64..80, chunk in 10u64..200) {
        let config = DiscoveryConfig { chunk_size: chunk, ..DiscoveryConfig::default() };
        let coordinator = common::memory_coordinator(config);
        coordinator.pool().initialize_range(chunk).unwrap();
        coordinator.registry().create(p, None).unwrap();
        prop_assert_eq!(coordinator.step().unwrap(), None);

        let bound = chunk - 1;
        let expected: Vec<u64> = if 2 * p <= bound {
            (2..chunk).filter(|&x| !(x >= 2 * p && x < bound && x % p == 0)).collect()
        } else {
            (2..=bound + (2 * p - bound).min(chunk)).collect()
        };
        prop_assert_eq!(coordinator.pool().snapshot().unwrap(), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Sequential discovery hands out 2, 3, 5, ... for any chunk size.
    #[test]
    fn prop_sequential_discovery_is_exact(chunk in 3u64..120, count in 1usize..30) {
        let config = DiscoveryConfig { chunk_size: chunk, ..DiscoveryConfig::default() };
        let coordinator = common::memory_coordinator(config);
        let mut found = Vec::new();
        while found.len() < count {
            if let Some(record) = coordinator.step().unwrap() {
                found.push(record.number);
            }
        }
        prop_assert_eq!(found, common::first_primes(count));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Discovery leaves a band just below the frontier that growth added and
    /// the rotation has not reached yet. Maintaining every prime whose square
    /// lies below the frontier `B` settles `[2, B)`: what remains there is
    /// exactly the numbers above the largest prime with no registered factor.
    #[test]
    fn prop_settled_region_is_fully_sieved(chunk in 3u64..120, count in 1usize..30) {
        let config = DiscoveryConfig { chunk_size: chunk, ..DiscoveryConfig::default() };
        let coordinator = common::memory_coordinator(config);
        let mut found = 0;
        while found < count {
            if coordinator.step().unwrap().is_some() {
                found += 1;
            }
        }

        let Some(bound) = coordinator.pool().max_number().unwrap() else {
            return Ok(());
        };
        let primes = coordinator.registry().primes().unwrap();
        let largest = *primes.last().unwrap();
        let sievers: Vec<u64> = primes.iter().copied().filter(|&p| p * p < bound).collect();
        for &p in &sievers {
            // p * p < bound implies 2p < bound: this sieves, never grows.
            coordinator.maintain(p).unwrap();
        }
        prop_assert_eq!(coordinator.pool().max_number().unwrap(), Some(bound));

        let settled: Vec<u64> = coordinator
            .pool()
            .snapshot()
            .unwrap()
            .into_iter()
            .filter(|&n| n < bound)
            .collect();
        for &n in &settled {
            prop_assert!(
                sievers.iter().all(|&p| n % p != 0),
                "{} survives below {} but has a registered factor", n, bound
            );
        }
        let expected: Vec<u64> = (largest + 1..bound)
            .filter(|&n| primes.iter().all(|&p| n % p != 0))
            .collect();
        prop_assert_eq!(settled, expected);
    }
}

// == Registry Properties =======================================================

proptest! {
    #[test]
    fn prop_list_top_is_descending_prefix(
        numbers in prop::collection::btree_set(1u64..10_000, 0..30),
        limit in 0usize..40,
    ) {
        let registry = PrimeRegistry::new(
            Arc::new(MemoryStore::new()),
            "prime",
            RetryPolicy::default(),
            Arc::new(Metrics::new()),
        );
        registry.ensure_sentinel().unwrap();
        for &n in &numbers {
            registry.create(n, None).unwrap();
        }
        let top: Vec<u64> = registry.list_top(limit).unwrap().into_iter().map(|r| r.number).collect();
        let expected: Vec<u64> = numbers.iter().rev().take(limit).copied().collect();
        prop_assert_eq!(top, expected);
    }
}

// == Budget Properties =========================================================

proptest! {
    /// Whenever the budget allows another step, the run so far fits in the
    /// limit, and one more step of mean length still does.
    #[test]
    fn prop_projection_allows_only_fitting_steps(
        elapsed_ms in 0u64..10_000,
        steps in 1u32..50,
        limit_ms in 1u64..10_000,
    ) {
        let elapsed = Duration::from_millis(elapsed_ms);
        let limit = Duration::from_millis(limit_ms);
        if !projection_exceeds(elapsed, steps, limit) {
            prop_assert!(elapsed <= limit);
            prop_assert!(elapsed + elapsed / steps <= limit + Duration::from_micros(1));
        }
    }
}
