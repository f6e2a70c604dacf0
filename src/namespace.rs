//! Namespace anchors.
//!
//! Each entity group is rooted at a `Root` entity named after the group
//! (`Root/sieve/sieve`, `Root/prime/prime`). Anchors carry no data; creating
//! them up front makes the groups visible in the store before the first
//! candidate or prime is written.

use crate::config::DiscoveryConfig;
use crate::store::{Entity, Key, Store, StoreError};
use tracing::debug;

pub const ROOT_KIND: &str = "Root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
    pub sieve: String,
    pub prime: String,
}

impl Namespaces {
    pub fn new(sieve: impl Into<String>, prime: impl Into<String>) -> Self {
        Namespaces {
            sieve: sieve.into(),
            prime: prime.into(),
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Namespaces::new(&config.sieve_namespace, &config.prime_namespace)
    }

    pub fn anchor_key(group: &str) -> Key {
        Key::new(ROOT_KIND, group, group)
    }

    /// Create both anchors if missing. Safe to call from every caller.
    pub fn anchor<S: Store>(&self, store: &S) -> Result<(), StoreError> {
        for group in [&self.sieve, &self.prime] {
            if store.create_if_absent(Entity::new(Namespaces::anchor_key(group)))? {
                debug!(group = %group, "namespace anchor created");
            }
        }
        Ok(())
    }
}

impl Default for Namespaces {
    fn default() -> Self {
        Namespaces::from_config(&DiscoveryConfig::default())
    }
}
