//! Shared test helpers for integration tests.

#![allow(dead_code)]

use primeshare::prom_metrics::Metrics;
use primeshare::store::memory::MemoryStore;
use primeshare::store::postgres::PgStore;
use primeshare::{DiscoveryConfig, DiscoveryCoordinator};
use std::sync::{Arc, Once};

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// One-time schema initialization.
static SCHEMA_INIT: Once = Once::new();

/// Ensure the test database schema is set up (runs once per test binary).
pub fn ensure_schema() {
    SCHEMA_INIT.call_once(|| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = PgStore::connect(&test_db_url(), 1, tokio::runtime::Handle::current())
                .await
                .unwrap();
            store.migrate().await.unwrap();
        });
    });
}

/// Configuration whose namespaces are private to one test, so tests sharing
/// the database never see each other's entities.
pub fn isolated_config(test: &str) -> DiscoveryConfig {
    DiscoveryConfig {
        sieve_namespace: format!("sieve_{}", test),
        prime_namespace: format!("prime_{}", test),
        ..DiscoveryConfig::default()
    }
}

/// Connect to the test database and clear the namespaces of `config`.
///
/// The runtime must outlive the store; the store's calls block on it from
/// the test thread.
pub fn pg_store(config: &DiscoveryConfig) -> (tokio::runtime::Runtime, PgStore) {
    ensure_schema();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt
        .block_on(PgStore::connect(&test_db_url(), 16, rt.handle().clone()))
        .expect("Failed to connect to test database");
    rt.block_on(
        sqlx::query("DELETE FROM entities WHERE grp = $1 OR grp = $2")
            .bind(&config.sieve_namespace)
            .bind(&config.prime_namespace)
            .execute(store.pool()),
    )
    .unwrap();
    (rt, store)
}

pub fn memory_coordinator(config: DiscoveryConfig) -> DiscoveryCoordinator<Arc<MemoryStore>> {
    DiscoveryCoordinator::new(Arc::new(MemoryStore::new()), config, Arc::new(Metrics::new())).unwrap()
}

pub fn is_prime(n: u64) -> bool {
    n >= 2 && (2..).take_while(|d| d * d <= n).all(|d| n % d != 0)
}

pub fn first_primes(count: usize) -> Vec<u64> {
    (2..).filter(|&n| is_prime(n)).take(count).collect()
}
