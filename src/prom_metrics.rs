//! # Prometheus Metrics
//!
//! Counters for the discovery protocol, rendered in the Prometheus text
//! exposition format.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `primeshare_steps_total` | Counter | - | Discovery steps started |
//! | `primeshare_primes_discovered_total` | Counter | - | New primes minted |
//! | `primeshare_conflicts_total` | Counter | `operation` | Lost optimistic-concurrency races |
//! | `primeshare_retries_exhausted_total` | Counter | `operation` | Operations that hit the attempt ceiling |
//! | `primeshare_budget_expired_total` | Counter | - | `discover_prime` calls that ran out of time |
//! | `primeshare_candidates_added_total` | Counter | - | Candidates inserted by growth or seeding |
//! | `primeshare_candidates_removed_total` | Counter | - | Candidates crossed out by sieving |

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct OperationLabel {
    pub operation: String,
}

/// Thread-safe metrics registry; every field is atomic and may be updated
/// from any caller thread.
#[derive(Debug)]
pub struct Metrics {
    pub registry: Registry,
    pub steps: Counter,
    pub primes_discovered: Counter,
    pub conflicts: Family<OperationLabel, Counter>,
    pub retries_exhausted: Family<OperationLabel, Counter>,
    pub budget_expired: Counter,
    pub candidates_added: Counter,
    pub candidates_removed: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let steps = Counter::default();
        registry.register("primeshare_steps", "Discovery steps started", steps.clone());

        let primes_discovered = Counter::default();
        registry.register(
            "primeshare_primes_discovered",
            "New primes minted and handed to a requester",
            primes_discovered.clone(),
        );

        let conflicts = Family::<OperationLabel, Counter>::default();
        registry.register(
            "primeshare_conflicts",
            "Optimistic-concurrency races lost, by operation",
            conflicts.clone(),
        );

        let retries_exhausted = Family::<OperationLabel, Counter>::default();
        registry.register(
            "primeshare_retries_exhausted",
            "Operations that reached the attempt ceiling, by operation",
            retries_exhausted.clone(),
        );

        let budget_expired = Counter::default();
        registry.register(
            "primeshare_budget_expired",
            "Discovery calls that ran out of time budget",
            budget_expired.clone(),
        );

        let candidates_added = Counter::default();
        registry.register(
            "primeshare_candidates_added",
            "Sieve candidates inserted",
            candidates_added.clone(),
        );

        let candidates_removed = Counter::default();
        registry.register(
            "primeshare_candidates_removed",
            "Sieve candidates crossed out as composite",
            candidates_removed.clone(),
        );

        Self {
            registry,
            steps,
            primes_discovered,
            conflicts,
            retries_exhausted,
            budget_expired,
            candidates_added,
            candidates_removed,
        }
    }

    pub fn record_conflict(&self, operation: &str) {
        self.conflicts
            .get_or_create(&OperationLabel {
                operation: operation.to_string(),
            })
            .inc();
    }

    pub fn record_exhausted(&self, operation: &str) {
        self.retries_exhausted
            .get_or_create(&OperationLabel {
                operation: operation.to_string(),
            })
            .inc();
    }

    pub fn conflicts_for(&self, operation: &str) -> u64 {
        self.conflicts
            .get_or_create(&OperationLabel {
                operation: operation.to_string(),
            })
            .get()
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
