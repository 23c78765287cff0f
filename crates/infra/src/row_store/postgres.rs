//! Postgres-backed row store.
//!
//! Rows travel as `jsonb`: reads select `to_jsonb(t)` and inserts go through
//! `jsonb_populate_record`, so any table whose primary key columns are
//! integer, text or uuid can be used as a signal table without generated
//! mapping code.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | StoreError | Scenario |
//! |-----------------------|------------|----------|
//! | `40001` | `SerializationConflict` | Serialization failure |
//! | `40P01` | `SerializationConflict` | Deadlock detected |
//! | `55P03` | `SerializationConflict` | Lock not available (`lock_timeout`) |
//! | `23505`, `23503`, `23514` | `IntegrityViolation` | Constraint violations |
//! | `42P01` | `UnknownTable` | Table does not exist |
//! | Any other / non-database | `Backend` | Network errors, pool closed, etc. |
//!
//! ## Runtime
//!
//! The [`StoreSession`] contract is blocking. The store owns a small tokio
//! runtime and drives every SQLx future on it with `block_on`, so sessions can
//! be used from plain threads (commit hooks, CLI). Do not call into a session
//! from inside another tokio runtime.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row as _, Transaction};
use tokio::runtime::Runtime;
use tracing::instrument;

use signalbus_core::{Direction, KeyValue, OrderBy, PrimaryKey, Row, TableSchema};

use super::r#trait::{CONFLICT_CODES, RowStore, StoreError, StoreSession};

/// Postgres row store over an SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresRowStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PostgresRowStore {
    /// Connect to `database_url` with a pool of at most `max_connections`.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("signalbus-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to start runtime: {e}")))?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl RowStore for PostgresRowStore {
    fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        Ok(Box::new(PostgresSession {
            pool: self.pool.clone(),
            runtime: Arc::clone(&self.runtime),
            tx: None,
        }))
    }
}

/// One connection's worth of work; the transaction is begun lazily.
pub struct PostgresSession {
    pool: PgPool,
    runtime: Arc<Runtime>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl std::fmt::Debug for PostgresSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSession")
            .field("in_transaction", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}

impl PostgresSession {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        if self.tx.is_none() {
            let tx = self
                .runtime
                .block_on(self.pool.begin())
                .map_err(|e| map_sqlx_error("begin", e))?;
            self.tx = Some(tx);
        }
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Backend("transaction not started".to_string()))
    }

    fn fetch_json(&mut self, operation: &str, mut query: QueryBuilder<'_, Postgres>) -> Result<Vec<JsonValue>, StoreError> {
        let runtime = Arc::clone(&self.runtime);
        let tx = self.tx()?;
        let rows = runtime
            .block_on(query.build().fetch_all(&mut **tx))
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter()
            .map(|r| r.try_get::<JsonValue, _>("row"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error(operation, e))
    }

    fn fetch_rows(
        &mut self,
        operation: &str,
        schema: &TableSchema,
        query: QueryBuilder<'_, Postgres>,
    ) -> Result<Vec<Row>, StoreError> {
        self.fetch_json(operation, query)?
            .into_iter()
            .map(|value| schema.row_from_json(value).map_err(StoreError::from))
            .collect()
    }
}

impl StoreSession for PostgresSession {
    #[instrument(skip(self, schema, row), fields(table = %schema.name(), pk = %row.pk()), err)]
    fn insert(&mut self, schema: &TableSchema, row: Row) -> Result<(), StoreError> {
        let mut query = insert_query(schema, row.into_json());
        let runtime = Arc::clone(&self.runtime);
        let tx = self.tx()?;
        runtime
            .block_on(query.build().execute(&mut **tx))
            .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    #[instrument(skip(self, schema, order_by), fields(table = %schema.name()), err)]
    fn query(&mut self, schema: &TableSchema, order_by: &[OrderBy], limit: Option<usize>) -> Result<Vec<Row>, StoreError> {
        let query = select_query(schema, Projection::Row, order_by, limit, Lock::None);
        self.fetch_rows("query", schema, query)
    }

    #[instrument(skip(self, schema, order_by), fields(table = %schema.name()), err)]
    fn query_pks(
        &mut self,
        schema: &TableSchema,
        order_by: &[OrderBy],
        limit: Option<usize>,
    ) -> Result<Vec<PrimaryKey>, StoreError> {
        let query = select_query(schema, Projection::Key, order_by, limit, Lock::None);
        self.fetch_json("query_pks", query)?
            .into_iter()
            .map(|value| match value {
                JsonValue::Object(fields) => {
                    PrimaryKey::from_fields(schema.primary_key(), &fields).map_err(StoreError::from)
                }
                other => Err(StoreError::Backend(format!("unexpected key row: {other}"))),
            })
            .collect()
    }

    #[instrument(skip(self, schema, pks), fields(table = %schema.name(), count = pks.len()), err)]
    fn lock_for_update(&mut self, schema: &TableSchema, pks: &[PrimaryKey]) -> Result<Vec<Row>, StoreError> {
        if pks.is_empty() {
            return Ok(Vec::new());
        }
        let query = lock_query(schema, pks);
        let mut by_key: HashMap<PrimaryKey, Row> = self
            .fetch_rows("lock_for_update", schema, query)?
            .into_iter()
            .map(|row| (row.pk().clone(), row))
            .collect();
        Ok(pks.iter().filter_map(|pk| by_key.remove(pk)).collect())
    }

    #[instrument(skip(self, schema, order_by), fields(table = %schema.name()), err)]
    fn query_for_update(
        &mut self,
        schema: &TableSchema,
        order_by: &[OrderBy],
        limit: Option<usize>,
        skip_locked: bool,
    ) -> Result<Vec<Row>, StoreError> {
        let lock = if skip_locked { Lock::SkipLocked } else { Lock::Wait };
        let query = select_query(schema, Projection::Row, order_by, limit, lock);
        self.fetch_rows("query_for_update", schema, query)
    }

    #[instrument(skip(self, schema), fields(table = %schema.name(), pk = %pk), err)]
    fn delete(&mut self, schema: &TableSchema, pk: &PrimaryKey) -> Result<bool, StoreError> {
        let mut query = delete_query(schema, pk);
        let runtime = Arc::clone(&self.runtime);
        let tx = self.tx()?;
        let result = runtime
            .block_on(query.build().execute(&mut **tx))
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, schema), fields(table = %schema.name()), err)]
    fn count(&mut self, schema: &TableSchema) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) AS n FROM {}", quote_table(schema.name()));
        let runtime = Arc::clone(&self.runtime);
        let tx = self.tx()?;
        let row = runtime
            .block_on(sqlx::query(&sql).fetch_one(&mut **tx))
            .map_err(|e| map_sqlx_error("count", e))?;
        let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count", e))?;
        Ok(n.max(0) as u64)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => self
                .runtime
                .block_on(tx.commit())
                .map_err(|e| map_sqlx_error("commit", e)),
            None => Ok(()),
        }
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => self
                .runtime
                .block_on(tx.rollback())
                .map_err(|e| map_sqlx_error("rollback", e)),
            None => Ok(()),
        }
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        let _ = self.rollback();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Projection {
    Row,
    Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lock {
    None,
    Wait,
    SkipLocked,
}

/// Quote an identifier for interpolation into SQL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name.
fn quote_table(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

fn key_tuple(schema: &TableSchema) -> String {
    let columns: Vec<String> = schema
        .primary_key()
        .iter()
        .map(|c| format!("t.{}", quote_ident(c.name())))
        .collect();
    format!("({})", columns.join(", "))
}

fn push_key(query: &mut QueryBuilder<'_, Postgres>, pk: &PrimaryKey) {
    query.push("(");
    let mut values = query.separated(", ");
    for value in pk.values() {
        match value {
            KeyValue::Int(v) => values.push_bind(*v),
            KeyValue::Text(v) => values.push_bind(v.clone()),
            KeyValue::Uuid(v) => values.push_bind(*v),
        };
    }
    query.push(")");
}

fn push_order_by(query: &mut QueryBuilder<'_, Postgres>, schema: &TableSchema, order_by: &[OrderBy]) {
    let mut terms: Vec<String> = order_by
        .iter()
        .map(|o| {
            let direction = match o.direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            format!("t.{} {direction}", quote_ident(o.column()))
        })
        .collect();
    // Primary key columns break ties.
    terms.extend(
        schema
            .primary_key()
            .iter()
            .map(|c| format!("t.{} ASC", quote_ident(c.name()))),
    );
    query.push(" ORDER BY ");
    query.push(terms.join(", "));
}

fn projection_sql(schema: &TableSchema, projection: Projection) -> String {
    match projection {
        Projection::Row => "to_jsonb(t) AS row".to_string(),
        Projection::Key => {
            let pairs: Vec<String> = schema
                .primary_key()
                .iter()
                .map(|c| format!("'{}', t.{}", c.name().replace('\'', "''"), quote_ident(c.name())))
                .collect();
            format!("jsonb_build_object({}) AS row", pairs.join(", "))
        }
    }
}

fn select_query(
    schema: &TableSchema,
    projection: Projection,
    order_by: &[OrderBy],
    limit: Option<usize>,
    lock: Lock,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(format!(
        "SELECT {} FROM {} AS t",
        projection_sql(schema, projection),
        quote_table(schema.name())
    ));
    push_order_by(&mut query, schema, order_by);
    if let Some(limit) = limit {
        query.push(format!(" LIMIT {limit}"));
    }
    match lock {
        Lock::None => {}
        Lock::Wait => {
            query.push(" FOR UPDATE");
        }
        Lock::SkipLocked => {
            query.push(" FOR UPDATE SKIP LOCKED");
        }
    }
    query
}

fn lock_query(schema: &TableSchema, pks: &[PrimaryKey]) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(format!(
        "SELECT {} FROM {} AS t WHERE {} IN (",
        projection_sql(schema, Projection::Row),
        quote_table(schema.name()),
        key_tuple(schema)
    ));
    for (idx, pk) in pks.iter().enumerate() {
        if idx > 0 {
            query.push(", ");
        }
        push_key(&mut query, pk);
    }
    query.push(") FOR UPDATE");
    query
}

fn delete_query(schema: &TableSchema, pk: &PrimaryKey) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(format!(
        "DELETE FROM {} AS t WHERE {} = ",
        quote_table(schema.name()),
        key_tuple(schema)
    ));
    push_key(&mut query, pk);
    query
}

fn insert_query(schema: &TableSchema, row: JsonValue) -> QueryBuilder<'static, Postgres> {
    let table = quote_table(schema.name());
    let mut query = QueryBuilder::new(format!(
        "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, "
    ));
    query.push_bind(row);
    query.push(")");
    query
}

/// Map SQLx errors into store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code() {
                Some(code) if CONFLICT_CODES.contains(&code.as_ref()) => StoreError::conflict(code.as_ref(), msg),
                Some(code) if matches!(code.as_ref(), "23505" | "23503" | "23514") => {
                    StoreError::IntegrityViolation(msg)
                }
                Some(code) if code.as_ref() == "42P01" => StoreError::UnknownTable(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signalbus_core::KeyColumn;

    const COMPOSITE: &[KeyColumn] = &[KeyColumn::int("debtor_id"), KeyColumn::text("reference")];
    const SCHEMA: TableSchema = TableSchema::new("app.transfer_signal", COMPOSITE);

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_table("app.transfer_signal"), "\"app\".\"transfer_signal\"");
    }

    #[test]
    fn skip_locked_page_query() {
        let query = select_query(
            &SCHEMA,
            Projection::Row,
            &[OrderBy::desc("priority")],
            Some(500),
            Lock::SkipLocked,
        );
        assert_eq!(
            query.sql(),
            "SELECT to_jsonb(t) AS row FROM \"app\".\"transfer_signal\" AS t \
             ORDER BY t.\"priority\" DESC, t.\"debtor_id\" ASC, t.\"reference\" ASC \
             LIMIT 500 FOR UPDATE SKIP LOCKED"
        );
    }

    #[test]
    fn key_snapshot_query_builds_objects() {
        let query = select_query(&SCHEMA, Projection::Key, &[], None, Lock::None);
        assert_eq!(
            query.sql(),
            "SELECT jsonb_build_object('debtor_id', t.\"debtor_id\", 'reference', t.\"reference\") AS row \
             FROM \"app\".\"transfer_signal\" AS t ORDER BY t.\"debtor_id\" ASC, t.\"reference\" ASC"
        );
    }

    #[test]
    fn lock_and_delete_bind_key_tuples() {
        let a = PrimaryKey::new(vec![KeyValue::Int(1), KeyValue::Text("x".to_string())]);
        let b = PrimaryKey::new(vec![KeyValue::Int(2), KeyValue::Text("y".to_string())]);

        let lock = lock_query(&SCHEMA, &[a.clone(), b]);
        assert!(lock.sql().ends_with(
            "WHERE (t.\"debtor_id\", t.\"reference\") IN (($1, $2), ($3, $4)) FOR UPDATE"
        ));

        let delete = delete_query(&SCHEMA, &a);
        assert_eq!(
            delete.sql(),
            "DELETE FROM \"app\".\"transfer_signal\" AS t WHERE (t.\"debtor_id\", t.\"reference\") = ($1, $2)"
        );
    }

    #[test]
    fn insert_populates_from_json() {
        let query = insert_query(&SCHEMA, json!({"debtor_id": 1, "reference": "x"}));
        assert_eq!(
            query.sql(),
            "INSERT INTO \"app\".\"transfer_signal\" SELECT * FROM \
             jsonb_populate_record(NULL::\"app\".\"transfer_signal\", $1)"
        );
    }
}
