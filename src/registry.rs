//! # Prime Registry
//!
//! Durable records of every prime discovered so far, plus the bookkeeping
//! that spreads sieve work across them. Each record carries the time it was
//! last handed to a caller; [`PrimeRegistry::claim_next`] always picks the
//! record that has waited longest (ties broken by the smaller number) and
//! bumps its timestamp, so concurrent callers rotate through all known
//! primes round-robin.
//!
//! ## Sentinel
//!
//! Record `0` is not a prime. It stands for "pop a fresh candidate from the
//! pool" and takes part in the rotation like any other record. It is created
//! lazily the first time a claim finds the registry empty.
//!
//! ## Timestamps
//!
//! `last_assigned_at` is stored as integer microseconds since the epoch. A
//! claim sets it to `max(now, newest + 1µs)`, where `newest` is the latest
//! timestamp anywhere in the registry, read inside the claim transaction.
//! A claimed record therefore always moves behind every other record, even
//! when several claims land in the same microsecond, and a stale observation
//! can never carry the value the record is re-verified against.

use crate::error::Result;
use crate::prom_metrics::Metrics;
use crate::retry::{Attempt, RetryPolicy};
use crate::store::{Direction, Entity, Key, Query, Store};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Entity kind for prime records.
pub const PRIME_KIND: &str = "Prime";

/// Number of the bootstrap record that means "take a fresh candidate".
pub const SENTINEL: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeRecord {
    pub number: u64,
    pub owner: Option<String>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub last_assigned_at: DateTime<Utc>,
}

impl PrimeRecord {
    pub fn new(number: u64, owner: Option<String>) -> Self {
        PrimeRecord {
            number,
            owner,
            last_assigned_at: now_micros(),
        }
    }

    pub fn sentinel() -> Self {
        PrimeRecord::new(SENTINEL, None)
    }

    pub fn is_sentinel(&self) -> bool {
        self.number == SENTINEL
    }
}

/// Current time truncated to the stored microsecond precision.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Timestamp for a new claim: now, but strictly after `newest`.
pub fn next_assignment(newest: DateTime<Utc>) -> DateTime<Utc> {
    let now = now_micros();
    if now > newest {
        now
    } else {
        newest + Duration::microseconds(1)
    }
}

pub struct PrimeRegistry<S> {
    store: S,
    group: String,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl<S: Store> PrimeRegistry<S> {
    pub fn new(store: S, group: impl Into<String>, retry: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        PrimeRegistry {
            store,
            group: group.into(),
            retry,
            metrics,
        }
    }

    fn key(&self, number: u64) -> Key {
        Key::numeric(PRIME_KIND, &self.group, number)
    }

    fn query(&self) -> Query {
        Query::new(PRIME_KIND, &self.group)
    }

    /// Claim the least-recently-assigned record, bumping its timestamp.
    ///
    /// Creates the sentinel when the registry is empty. Fails with
    /// `TooManyRetries` once the attempt ceiling is reached.
    pub fn claim_next(&self) -> Result<PrimeRecord> {
        self.retry.run_or_fail("claim_next", |attempt| {
            let oldest = self.store.query(
                &self
                    .query()
                    .order_by("last_assigned_at", Direction::Ascending)
                    .order_by("number", Direction::Ascending)
                    .limit(1),
            )?;
            let Some(entity) = oldest.into_iter().next() else {
                self.ensure_sentinel()?;
                return Ok(Attempt::Conflict);
            };
            let observed: PrimeRecord = entity.decode()?;
            let outcome = self.try_claim(&observed)?;
            if outcome.is_conflict() {
                self.metrics.record_conflict("claim_next");
                debug!(attempt, number = observed.number, "claim lost race");
            }
            Ok(outcome)
        })
    }

    /// One claim attempt against an observed record. Succeeds only if the
    /// stored timestamp still equals the observed one.
    pub fn try_claim(&self, observed: &PrimeRecord) -> Result<Attempt<PrimeRecord>> {
        let key = self.key(observed.number);
        let result = self.store.run_in_transaction(&self.group, |txn| {
            let Some(current) = txn.get(&key)? else {
                return Ok(None);
            };
            let mut current: PrimeRecord = current.decode()?;
            if current.last_assigned_at != observed.last_assigned_at {
                return Ok(None);
            }
            let mut newest = current.last_assigned_at;
            let latest = self.query().order_by("last_assigned_at", Direction::Descending).limit(1);
            if let Some(entity) = txn.query(&latest)?.first() {
                newest = newest.max(entity.decode::<PrimeRecord>()?.last_assigned_at);
            }
            current.last_assigned_at = next_assignment(newest);
            txn.put(Entity::from_record(key.clone(), &current)?)?;
            Ok(Some(current))
        });
        Ok(Attempt::from_transaction(result)?)
    }

    /// Create the sentinel if it does not exist. Returns true when this call
    /// created it.
    pub fn ensure_sentinel(&self) -> Result<bool> {
        let sentinel = PrimeRecord::sentinel();
        let created = self
            .store
            .create_if_absent(Entity::from_record(self.key(SENTINEL), &sentinel)?)?;
        if created {
            debug!(group = %self.group, "sentinel created");
        }
        Ok(created)
    }

    /// Register a newly discovered prime. `None` when a record for `number`
    /// already exists; the stored record is left untouched.
    pub fn create(&self, number: u64, owner: Option<&str>) -> Result<Option<PrimeRecord>> {
        let record = PrimeRecord::new(number, owner.map(str::to_string));
        let inserted = self
            .store
            .create_if_absent(Entity::from_record(self.key(number), &record)?)?;
        Ok(inserted.then_some(record))
    }

    pub fn get(&self, number: u64) -> Result<Option<PrimeRecord>> {
        match self.store.get(&self.key(number))? {
            Some(entity) => Ok(Some(entity.decode()?)),
            None => Ok(None),
        }
    }

    /// Set the owner on the stored copy of `record`. Non-transactional: a
    /// claim committed between the read and the write loses its timestamp
    /// bump, and the record simply comes round again sooner. Returns false
    /// when the record no longer exists.
    pub fn assign_owner(&self, record: &PrimeRecord, owner: &str) -> Result<bool> {
        let Some(mut current) = self.get(record.number)? else {
            return Ok(false);
        };
        current.owner = Some(owner.to_string());
        self.store
            .put(Entity::from_record(self.key(record.number), &current)?)?;
        Ok(true)
    }

    /// Up to `limit` largest primes, descending. The sentinel is never listed.
    pub fn list_top(&self, limit: usize) -> Result<Vec<PrimeRecord>> {
        let rows = self.store.query(
            &self
                .query()
                .order_by("number", Direction::Descending)
                .limit(limit.saturating_add(1)),
        )?;
        let mut records = Vec::with_capacity(rows.len());
        for entity in rows {
            let record: PrimeRecord = entity.decode()?;
            if !record.is_sentinel() {
                records.push(record);
            }
        }
        records.truncate(limit);
        Ok(records)
    }

    /// Numbers owned by `owner`, ascending.
    pub fn list_for_owner(&self, owner: &str) -> Result<Vec<u64>> {
        let rows = self.store.query(
            &self
                .query()
                .filter("owner", owner)
                .order_by("number", Direction::Ascending),
        )?;
        let mut numbers = Vec::with_capacity(rows.len());
        for entity in rows {
            let record: PrimeRecord = entity.decode()?;
            if !record.is_sentinel() {
                numbers.push(record.number);
            }
        }
        Ok(numbers)
    }

    /// Largest real prime on record.
    pub fn largest_prime(&self) -> Result<Option<u64>> {
        Ok(self.list_top(1)?.first().map(|r| r.number))
    }

    /// Every real prime on record, ascending.
    pub fn primes(&self) -> Result<Vec<u64>> {
        let rows = self
            .store
            .query(&self.query().order_by("number", Direction::Ascending))?;
        let mut numbers = Vec::with_capacity(rows.len());
        for entity in rows {
            let record: PrimeRecord = entity.decode()?;
            if !record.is_sentinel() {
                numbers.push(record.number);
            }
        }
        Ok(numbers)
    }
}
