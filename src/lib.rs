//! # primeshare
//!
//! Incremental prime discovery shared among many concurrent, uncoordinated
//! callers. Each caller asks for "a new prime" and receives one that nobody
//! else has been handed. There are no locks and no messages between callers:
//! all coordination happens through a transactional store that offers only
//! single-entity-group transactions with optimistic-concurrency conflicts.
//!
//! ## Architecture
//!
//! ```text
//!   callers (rayon / std threads)
//!        │ discover_prime()
//!        ▼
//!   DiscoveryCoordinator ── TimeBudget ── step() ×N
//!        │                                  │
//!        ├── PrimeRegistry  (group "prime") ├── claim_next / create
//!        └── CandidatePool  (group "sieve") └── pop / ensure / remove
//!                   │
//!                   ▼
//!             Store trait ── MemoryStore | PgStore
//! ```
//!
//! ## Modules
//!
//! - [`store`]: entity model, `Store`/`Transaction` traits, in-memory and
//!   PostgreSQL backends.
//! - [`retry`]: bounded-attempt combinator and soft time budget.
//! - [`pool`]: the shared sieve of candidates.
//! - [`registry`]: durable prime records and round-robin claiming.
//! - [`coordinator`]: the discovery step and the boundary operations.
//! - [`namespace`]: entity-group anchors.
//! - [`config`]: TOML configuration.
//! - [`prom_metrics`]: Prometheus counters.
//! - [`progress`]: hunt progress counters and reporter.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod namespace;
pub mod pool;
pub mod progress;
pub mod prom_metrics;
pub mod registry;
pub mod retry;
pub mod store;

pub use config::DiscoveryConfig;
pub use coordinator::DiscoveryCoordinator;
pub use error::{DiscoveryError, Result};
pub use registry::PrimeRecord;
