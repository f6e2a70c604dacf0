//! # PgStore: PostgreSQL Backend
//!
//! Persists entities in a single `entities` table keyed by
//! `(kind, grp, name)` with a JSONB property bag. Queries order on
//! `props -> 'field'`, which compares JSON numbers numerically.
//!
//! ## Conflict Detection
//!
//! Transactions run at `SERIALIZABLE` isolation. PostgreSQL aborts the loser
//! of a read-write race with SQLSTATE `40001` (or `40P01` on deadlock); both
//! surface as [`StoreError::Conflict`] so the caller's retry policy treats them
//! like any other optimistic-concurrency collision.
//!
//! ## Sync Bridge
//!
//! The store is synchronous: every call drives the async `sqlx` future with
//! `tokio::runtime::Handle::block_on`. Callers must run on threads that are
//! not Tokio workers (rayon threads, `std::thread`), otherwise `block_on`
//! panics.

use super::{Direction, Entity, Key, Query, Store, StoreError, Transaction};
use anyhow::Result;
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgExecutor, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tokio::runtime::Handle;
use tracing::debug;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS entities (
    kind  TEXT  NOT NULL,
    grp   TEXT  NOT NULL,
    name  TEXT  NOT NULL,
    props JSONB NOT NULL DEFAULT '{}'::jsonb,
    PRIMARY KEY (kind, grp, name)
);
CREATE INDEX IF NOT EXISTS entities_number_idx ON entities (kind, grp, (props -> 'number'));";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    rt: Handle,
}

impl PgStore {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// The URL is parsed by hand so that pooler usernames containing dots
    /// survive intact.
    pub async fn connect(database_url: &str, max_connections: u32, rt: Handle) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username)
            .statement_cache_capacity(0);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;
        Ok(PgStore { pool, rt })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `entities` table and its index if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

/// Map a driver error, turning serialization failures into conflicts.
fn map_err(group: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
            return StoreError::Conflict {
                group: group.to_string(),
            };
        }
    }
    StoreError::Database(err)
}

fn row_to_entity(row: &PgRow) -> Result<Entity, sqlx::Error> {
    let props: Value = row.try_get("props")?;
    let props = match props {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(Entity {
        key: Key::new(
            row.try_get::<String, _>("kind")?,
            row.try_get::<String, _>("grp")?,
            row.try_get::<String, _>("name")?,
        ),
        props,
    })
}

/// Build the SELECT for a validated query. Field names are interpolated, so
/// callers must run [`Query::validate`] first.
fn select_sql(query: &Query) -> String {
    let mut sql = String::from("SELECT kind, grp, name, props FROM entities WHERE kind = $1 AND grp = $2");
    if let Some((field, _)) = &query.filter {
        sql.push_str(&format!(" AND props -> '{}' = $3", field));
    }
    sql.push_str(" ORDER BY ");
    for (field, direction) in &query.order {
        let dir = match direction {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        };
        sql.push_str(&format!("props -> '{}' {}, ", field, dir));
    }
    sql.push_str("name ASC");
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit.min(i64::MAX as usize)));
    }
    sql
}

async fn fetch_entity<'e, E: PgExecutor<'e>>(exec: E, key: &Key) -> Result<Option<Entity>, sqlx::Error> {
    let row = sqlx::query("SELECT kind, grp, name, props FROM entities WHERE kind = $1 AND grp = $2 AND name = $3")
        .bind(&key.kind)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(row_to_entity).transpose()
}

async fn upsert_entity<'e, E: PgExecutor<'e>>(exec: E, entity: &Entity) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO entities (kind, grp, name, props) VALUES ($1, $2, $3, $4)
         ON CONFLICT (kind, grp, name) DO UPDATE SET props = EXCLUDED.props",
    )
    .bind(&entity.key.kind)
    .bind(&entity.key.group)
    .bind(&entity.key.name)
    .bind(Value::Object(entity.props.clone()))
    .execute(exec)
    .await?;
    Ok(())
}

async fn delete_entity<'e, E: PgExecutor<'e>>(exec: E, key: &Key) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM entities WHERE kind = $1 AND grp = $2 AND name = $3")
        .bind(&key.kind)
        .bind(&key.group)
        .bind(&key.name)
        .execute(exec)
        .await?;
    Ok(())
}

async fn select_entities<'e, E: PgExecutor<'e>>(exec: E, query: &Query) -> Result<Vec<Entity>, sqlx::Error> {
    let sql = select_sql(query);
    let mut q = sqlx::query(&sql).bind(&query.kind).bind(&query.group);
    if let Some((_, value)) = &query.filter {
        q = q.bind(value.clone());
    }
    let rows = q.fetch_all(exec).await?;
    rows.iter().map(row_to_entity).collect()
}

impl Store for PgStore {
    fn get(&self, key: &Key) -> Result<Option<Entity>, StoreError> {
        self.rt
            .block_on(fetch_entity(&self.pool, key))
            .map_err(|e| map_err(&key.group, e))
    }

    fn put(&self, entity: Entity) -> Result<(), StoreError> {
        self.rt
            .block_on(upsert_entity(&self.pool, &entity))
            .map_err(|e| map_err(&entity.key.group, e))
    }

    fn delete(&self, key: &Key) -> Result<(), StoreError> {
        self.rt
            .block_on(delete_entity(&self.pool, key))
            .map_err(|e| map_err(&key.group, e))
    }

    fn query(&self, query: &Query) -> Result<Vec<Entity>, StoreError> {
        query.validate()?;
        self.rt
            .block_on(select_entities(&self.pool, query))
            .map_err(|e| map_err(&query.group, e))
    }

    fn create_if_absent(&self, entity: Entity) -> Result<bool, StoreError> {
        let result = self.rt.block_on(
            sqlx::query(
                "INSERT INTO entities (kind, grp, name, props) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (kind, grp, name) DO NOTHING",
            )
            .bind(&entity.key.kind)
            .bind(&entity.key.group)
            .bind(&entity.key.name)
            .bind(Value::Object(entity.props.clone()))
            .execute(&self.pool),
        );
        let done = result.map_err(|e| map_err(&entity.key.group, e))?;
        Ok(done.rows_affected() == 1)
    }

    fn run_in_transaction<T, F>(&self, group: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, StoreError>,
    {
        let tx = self
            .rt
            .block_on(async {
                let mut tx = self.pool.begin().await?;
                sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                    .execute(&mut *tx)
                    .await?;
                Ok::<_, sqlx::Error>(tx)
            })
            .map_err(|e| map_err(group, e))?;

        let mut txn = PgTransaction {
            tx,
            rt: &self.rt,
            group: group.to_string(),
        };
        let outcome = f(&mut txn);
        let PgTransaction { tx, rt, .. } = txn;
        // Finish the transaction on the runtime: returning the connection to
        // the pool spawns a task, which needs a runtime context.
        match outcome {
            Ok(value) => {
                rt.block_on(tx.commit()).map_err(|e| map_err(group, e))?;
                debug!(group, "transaction committed");
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = rt.block_on(tx.rollback()) {
                    debug!(group, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

struct PgTransaction<'a> {
    tx: sqlx::Transaction<'static, Postgres>,
    rt: &'a Handle,
    group: String,
}

impl PgTransaction<'_> {
    fn check_group(&self, group: &str, key: impl FnOnce() -> Key) -> Result<(), StoreError> {
        if group != self.group {
            return Err(StoreError::CrossGroup {
                group: self.group.clone(),
                key: key(),
            });
        }
        Ok(())
    }
}

impl Transaction for PgTransaction<'_> {
    fn get(&mut self, key: &Key) -> Result<Option<Entity>, StoreError> {
        self.check_group(&key.group, || key.clone())?;
        self.rt
            .block_on(fetch_entity(&mut *self.tx, key))
            .map_err(|e| map_err(&self.group, e))
    }

    fn put(&mut self, entity: Entity) -> Result<(), StoreError> {
        self.check_group(&entity.key.group, || entity.key.clone())?;
        self.rt
            .block_on(upsert_entity(&mut *self.tx, &entity))
            .map_err(|e| map_err(&self.group, e))
    }

    fn delete(&mut self, key: &Key) -> Result<(), StoreError> {
        self.check_group(&key.group, || key.clone())?;
        self.rt
            .block_on(delete_entity(&mut *self.tx, key))
            .map_err(|e| map_err(&self.group, e))
    }

    fn query(&mut self, query: &Query) -> Result<Vec<Entity>, StoreError> {
        query.validate()?;
        self.check_group(&query.group, || Key::new(query.kind.clone(), query.group.clone(), ""))?;
        self.rt
            .block_on(select_entities(&mut *self.tx, query))
            .map_err(|e| map_err(&self.group, e))
    }
}
