//! # Store: Transactional Keyed Entity Store
//!
//! The coordination protocol needs only a small capability surface from its
//! storage backend: keyed get/put/delete, ordered queries within one entity
//! group, atomic create-if-absent, and single-group transactions that report
//! write-write collisions as a distinct [`StoreError::Conflict`].
//!
//! ## Entity Model
//!
//! ```text
//! Key { kind: "Prime", group: "prime", name: "key_17" }
//!  └─ Entity { key, props: {"number": 17, "owner": null, "last_assigned_at": 1718000000000000} }
//! ```
//!
//! An *entity group* is the transactional scope: every key in a transaction
//! must share the transaction's group. Numeric entities are named `key_<n>`,
//! so at most one record per number can exist in a group.
//!
//! ## Backends
//!
//! - [`memory::MemoryStore`]: in-process, per-group optimistic concurrency.
//! - [`postgres::PgStore`]: PostgreSQL via `sqlx`, SERIALIZABLE transactions.
//!
//! Both are synchronous. Callers run on rayon or plain std threads; the
//! PostgreSQL backend bridges into its async driver with `Handle::block_on`.

pub mod memory;
pub mod postgres;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

// ── Keys and entities ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub kind: String,
    pub group: String,
    pub name: String,
}

impl Key {
    pub fn new(kind: impl Into<String>, group: impl Into<String>, name: impl Into<String>) -> Self {
        Key {
            kind: kind.into(),
            group: group.into(),
            name: name.into(),
        }
    }

    /// Key for a number-identified entity (`key_<number>`).
    pub fn numeric(kind: impl Into<String>, group: impl Into<String>, number: u64) -> Self {
        Key::new(kind, group, format!("key_{}", number))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.group, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub key: Key,
    pub props: Map<String, Value>,
}

impl Entity {
    /// An entity with no properties (used for namespace anchors).
    pub fn new(key: Key) -> Self {
        Entity {
            key,
            props: Map::new(),
        }
    }

    /// Serialize a typed record into the entity's property map.
    pub fn from_record<T: Serialize>(key: Key, record: &T) -> Result<Self, StoreError> {
        match serde_json::to_value(record)? {
            Value::Object(props) => Ok(Entity { key, props }),
            _ => Err(StoreError::NotAnObject(key)),
        }
    }

    /// Deserialize the property map back into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(Value::Object(self.props.clone()))?)
    }

    /// Property value by name; missing properties read as JSON null.
    pub fn field(&self, name: &str) -> &Value {
        self.props.get(name).unwrap_or(&Value::Null)
    }
}

// ── Queries ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Ordered query over one kind within one entity group.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub kind: String,
    pub group: String,
    pub filter: Option<(String, Value)>,
    pub order: Vec<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(kind: impl Into<String>, group: impl Into<String>) -> Self {
        Query {
            kind: kind.into(),
            group: group.into(),
            filter: None,
            order: Vec::new(),
            limit: None,
        }
    }

    /// Equality filter on a single field.
    pub fn filter(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filter = Some((field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order.push((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whitelist field names: backends may interpolate them into query text.
    pub fn validate(&self) -> Result<(), StoreError> {
        let fields = self
            .filter
            .iter()
            .map(|(f, _)| f)
            .chain(self.order.iter().map(|(f, _)| f));
        for field in fields {
            if !is_safe_field(field) {
                return Err(StoreError::InvalidField(field.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn matches(&self, entity: &Entity) -> bool {
        if entity.key.kind != self.kind || entity.key.group != self.group {
            return false;
        }
        match &self.filter {
            Some((field, value)) => compare_values(entity.field(field), value) == Ordering::Equal,
            None => true,
        }
    }

    /// Sort order for matching entities. Falls back to the key name so that
    /// results are deterministic when every ordered field ties.
    pub(crate) fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        for (field, direction) in &self.order {
            let ord = compare_values(a.field(field), b.field(field));
            let ord = match direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.key.name.cmp(&b.key.name)
    }

    /// Filter, sort, and truncate a candidate set.
    pub(crate) fn apply<'a>(&self, entities: impl Iterator<Item = &'a Entity>) -> Vec<Entity> {
        let mut rows: Vec<Entity> = entities.filter(|e| self.matches(e)).cloned().collect();
        rows.sort_by(|a, b| self.compare(a, b));
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

pub(crate) fn is_safe_field(field: &str) -> bool {
    !field.is_empty() && field.bytes().all(|b| b.is_ascii_lowercase() || b == b'_')
}

/// Total order over JSON values matching PostgreSQL's `jsonb` btree order:
/// null < string < number < boolean < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::String(_) => 1,
            Value::Number(_) => 2,
            Value::Bool(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => match (x.as_u64(), y.as_u64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            },
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Null, Value::Null) | (Value::Object(_), Value::Object(_)) => Ordering::Equal,
        _ => rank(a).cmp(&rank(b)),
    }
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer committed to the entity group first. Transient.
    #[error("transaction on entity group '{group}' conflicted with a concurrent commit")]
    Conflict { group: String },

    #[error("entity {key} is outside transaction group '{group}'")]
    CrossGroup { group: String, key: Key },

    #[error("invalid query field '{0}'")]
    InvalidField(String),

    #[error("record for {0} does not serialize to an object")]
    NotAnObject(Key),

    #[error("entity (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

// ── Capability traits ───────────────────────────────────────────

/// Operations available inside one single-group transaction.
pub trait Transaction {
    fn get(&mut self, key: &Key) -> Result<Option<Entity>, StoreError>;
    fn put(&mut self, entity: Entity) -> Result<(), StoreError>;
    fn delete(&mut self, key: &Key) -> Result<(), StoreError>;
    fn query(&mut self, query: &Query) -> Result<Vec<Entity>, StoreError>;
}

pub trait Store: Send + Sync {
    fn get(&self, key: &Key) -> Result<Option<Entity>, StoreError>;

    fn put(&self, entity: Entity) -> Result<(), StoreError>;

    /// Deleting an absent key is not an error.
    fn delete(&self, key: &Key) -> Result<(), StoreError>;

    fn query(&self, query: &Query) -> Result<Vec<Entity>, StoreError>;

    /// Insert `entity` unless its key exists. Returns true when this call inserted.
    fn create_if_absent(&self, entity: Entity) -> Result<bool, StoreError>;

    /// Run `f` atomically against `group`. Returns [`StoreError::Conflict`]
    /// when a concurrent commit to the group wins; never retries by itself.
    fn run_in_transaction<T, F>(&self, group: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, StoreError>;
}

impl<S: Store> Store for std::sync::Arc<S> {
    fn get(&self, key: &Key) -> Result<Option<Entity>, StoreError> {
        (**self).get(key)
    }

    fn put(&self, entity: Entity) -> Result<(), StoreError> {
        (**self).put(entity)
    }

    fn delete(&self, key: &Key) -> Result<(), StoreError> {
        (**self).delete(key)
    }

    fn query(&self, query: &Query) -> Result<Vec<Entity>, StoreError> {
        (**self).query(query)
    }

    fn create_if_absent(&self, entity: Entity) -> Result<bool, StoreError> {
        (**self).create_if_absent(entity)
    }

    fn run_in_transaction<T, F>(&self, group: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, StoreError>,
    {
        (**self).run_in_transaction(group, f)
    }
}
