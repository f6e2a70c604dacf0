//! In-process store with per-entity-group optimistic concurrency.
//!
//! Every entity group carries a version counter. A transaction records the
//! group version when it begins; every read inside it and the final commit
//! re-check that version. Any committed write to the group in between (from
//! another transaction or a plain `put`/`delete`) turns the transaction into
//! a [`StoreError::Conflict`]. Writes are buffered until commit, so an
//! aborted transaction leaves no trace.

use super::{Entity, Key, Query, Store, StoreError, Transaction};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Default)]
struct GroupState {
    version: u64,
    entities: BTreeMap<Key, Entity>,
}

#[derive(Default)]
pub struct MemoryStore {
    groups: Mutex<HashMap<String, GroupState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current commit version of a group (0 for a group never written).
    pub fn group_version(&self, group: &str) -> u64 {
        self.groups.lock().get(group).map(|g| g.version).unwrap_or(0)
    }

    /// Number of entities of `kind` in `group`.
    pub fn count(&self, kind: &str, group: &str) -> usize {
        self.groups
            .lock()
            .get(group)
            .map(|g| g.entities.keys().filter(|k| k.kind == kind).count())
            .unwrap_or(0)
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &Key) -> Result<Option<Entity>, StoreError> {
        let groups = self.groups.lock();
        Ok(groups
            .get(&key.group)
            .and_then(|g| g.entities.get(key))
            .cloned())
    }

    fn put(&self, entity: Entity) -> Result<(), StoreError> {
        let mut groups = self.groups.lock();
        let group = groups.entry(entity.key.group.clone()).or_default();
        group.entities.insert(entity.key.clone(), entity);
        group.version += 1;
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<(), StoreError> {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get_mut(&key.group) {
            if group.entities.remove(key).is_some() {
                group.version += 1;
            }
        }
        Ok(())
    }

    fn query(&self, query: &Query) -> Result<Vec<Entity>, StoreError> {
        query.validate()?;
        let groups = self.groups.lock();
        Ok(match groups.get(&query.group) {
            Some(group) => query.apply(group.entities.values()),
            None => Vec::new(),
        })
    }

    fn create_if_absent(&self, entity: Entity) -> Result<bool, StoreError> {
        let mut groups = self.groups.lock();
        let group = groups.entry(entity.key.group.clone()).or_default();
        if group.entities.contains_key(&entity.key) {
            return Ok(false);
        }
        group.entities.insert(entity.key.clone(), entity);
        group.version += 1;
        Ok(true)
    }

    fn run_in_transaction<T, F>(&self, group: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, StoreError>,
    {
        let mut txn = MemoryTransaction {
            store: self,
            group: group.to_string(),
            base_version: self.group_version(group),
            writes: BTreeMap::new(),
        };
        let value = f(&mut txn)?;
        txn.commit()?;
        Ok(value)
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    group: String,
    base_version: u64,
    /// Buffered writes; `None` marks a delete.
    writes: BTreeMap<Key, Option<Entity>>,
}

impl MemoryTransaction<'_> {
    fn check_key(&self, key: &Key) -> Result<(), StoreError> {
        if key.group != self.group {
            return Err(StoreError::CrossGroup {
                group: self.group.clone(),
                key: key.clone(),
            });
        }
        Ok(())
    }

    fn conflict(&self) -> StoreError {
        StoreError::Conflict {
            group: self.group.clone(),
        }
    }

    fn commit(self) -> Result<(), StoreError> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut groups = self.store.groups.lock();
        let state = groups.entry(self.group.clone()).or_default();
        if state.version != self.base_version {
            debug!(group = %self.group, base = self.base_version, current = state.version, "commit conflict");
            return Err(StoreError::Conflict { group: self.group });
        }
        for (key, write) in self.writes {
            match write {
                Some(entity) => {
                    state.entities.insert(key, entity);
                }
                None => {
                    state.entities.remove(&key);
                }
            }
        }
        state.version += 1;
        Ok(())
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&mut self, key: &Key) -> Result<Option<Entity>, StoreError> {
        self.check_key(key)?;
        if let Some(write) = self.writes.get(key) {
            return Ok(write.clone());
        }
        let groups = self.store.groups.lock();
        let state = groups.get(&self.group);
        if state.map(|g| g.version).unwrap_or(0) != self.base_version {
            return Err(self.conflict());
        }
        Ok(state.and_then(|g| g.entities.get(key)).cloned())
    }

    fn put(&mut self, entity: Entity) -> Result<(), StoreError> {
        self.check_key(&entity.key)?;
        self.writes.insert(entity.key.clone(), Some(entity));
        Ok(())
    }

    fn delete(&mut self, key: &Key) -> Result<(), StoreError> {
        self.check_key(key)?;
        self.writes.insert(key.clone(), None);
        Ok(())
    }

    fn query(&mut self, query: &Query) -> Result<Vec<Entity>, StoreError> {
        query.validate()?;
        if query.group != self.group {
            return Err(StoreError::CrossGroup {
                group: self.group.clone(),
                key: Key::new(query.kind.clone(), query.group.clone(), ""),
            });
        }
        let groups = self.store.groups.lock();
        let state = groups.get(&self.group);
        if state.map(|g| g.version).unwrap_or(0) != self.base_version {
            return Err(self.conflict());
        }
        // Buffered writes shadow the stored copy; only matching rows are cloned.
        let stored = state
            .into_iter()
            .flat_map(|g| g.entities.values())
            .filter(|e| !self.writes.contains_key(&e.key));
        let buffered = self.writes.values().flatten();
        Ok(query.apply(stored.chain(buffered)))
    }
}
