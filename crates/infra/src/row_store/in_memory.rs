//! In-memory row store for tests/dev.
//!
//! - Read committed: sessions see committed rows plus their own changes
//! - Row locks with blocking waits, `SKIP LOCKED` support and a lock timeout
//!   (reported as a serialization conflict, like `lock_timeout` in Postgres)
//! - Unique primary keys enforced on insert and on commit
//! - Tables are created on first insert; unknown tables read as empty

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use signalbus_core::{OrderBy, PrimaryKey, Row, TableSchema};

use super::r#trait::{RowStore, StoreError, StoreSession};

type LockKey = (String, PrimaryKey);

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<String, BTreeMap<PrimaryKey, Row>>,
    /// Row lock owner by session id.
    locks: HashMap<LockKey, u64>,
}

impl Tables {
    fn contains(&self, table: &str, pk: &PrimaryKey) -> bool {
        self.rows.get(table).is_some_and(|m| m.contains_key(pk))
    }

    fn get(&self, table: &str, pk: &PrimaryKey) -> Option<&Row> {
        self.rows.get(table).and_then(|m| m.get(pk))
    }
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    released: Condvar,
    next_session: AtomicU64,
    injected_conflicts: AtomicU32,
    lock_timeout: Duration,
}

impl Shared {
    fn lock_tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| poisoned())
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("in-memory store lock poisoned".to_string())
}

/// Shared in-memory database. Clones share the same tables.
#[derive(Debug, Clone)]
pub struct InMemoryRowStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryRowStore {
    fn default() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                released: Condvar::new(),
                next_session: AtomicU64::new(1),
                injected_conflicts: AtomicU32::new(0),
                lock_timeout,
            }),
        }
    }

    /// Make the next `n` row-lock requests fail with a deadlock error.
    pub fn inject_conflicts(&self, n: u32) {
        self.shared.injected_conflicts.store(n, AtomicOrdering::SeqCst);
    }

    /// Committed rows of `table`, in primary key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.shared
            .lock_tables()
            .map(|t| t.rows.get(table).map(|m| m.values().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Number of committed rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.shared
            .lock_tables()
            .map(|t| t.rows.get(table).map_or(0, BTreeMap::len))
            .unwrap_or_default()
    }

    /// Insert and commit rows in a throwaway session.
    pub fn insert_committed(&self, schema: &TableSchema, rows: impl IntoIterator<Item = Row>) -> Result<(), StoreError> {
        let mut session = self.session();
        for row in rows {
            session.insert(schema, row)?;
        }
        session.commit()
    }

    fn session(&self) -> InMemorySession {
        InMemorySession {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_session.fetch_add(1, AtomicOrdering::SeqCst),
            inserts: Vec::new(),
            deletes: HashSet::new(),
            held: HashSet::new(),
        }
    }
}

impl RowStore for InMemoryRowStore {
    fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        Ok(Box::new(self.session()))
    }
}

/// One connection to an [`InMemoryRowStore`].
///
/// Uncommitted changes are buffered in the session and applied atomically on
/// commit. Dropping the session rolls back.
#[derive(Debug)]
pub struct InMemorySession {
    shared: Arc<Shared>,
    id: u64,
    inserts: Vec<(String, Row)>,
    deletes: HashSet<LockKey>,
    held: HashSet<LockKey>,
}

/// Wait for (or skip) the lock on `key`.
///
/// Returns the guard and whether the lock is now held by `session`.
fn acquire<'a>(
    shared: &'a Shared,
    mut tables: MutexGuard<'a, Tables>,
    session: u64,
    key: &LockKey,
    skip_locked: bool,
) -> Result<(MutexGuard<'a, Tables>, bool), StoreError> {
    let deadline = Instant::now() + shared.lock_timeout;
    loop {
        match tables.locks.get(key) {
            None => {
                tables.locks.insert(key.clone(), session);
                return Ok((tables, true));
            }
            Some(owner) if *owner == session => return Ok((tables, true)),
            Some(_) if skip_locked => return Ok((tables, false)),
            Some(_) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(StoreError::conflict(
                        "55P03",
                        format!("could not obtain lock on row {} in \"{}\"", key.1, key.0),
                    ));
                }
                let (guard, _) = shared
                    .released
                    .wait_timeout(tables, deadline - now)
                    .map_err(|_| poisoned())?;
                tables = guard;
            }
        }
    }
}

fn sort_rows(rows: &mut [Row], order_by: &[OrderBy]) {
    rows.sort_by(|a, b| a.compare_by(b, order_by));
}

impl InMemorySession {
    fn own_insert(&self, table: &str, pk: &PrimaryKey) -> Option<&Row> {
        self.inserts
            .iter()
            .find(|(t, r)| t == table && r.pk() == pk)
            .map(|(_, r)| r)
    }

    fn is_deleted(&self, table: &str, pk: &PrimaryKey) -> bool {
        self.deletes.contains(&(table.to_string(), pk.clone()))
    }

    fn visible(&self, tables: &Tables, table: &str, order_by: &[OrderBy]) -> Vec<Row> {
        let mut rows: Vec<Row> = tables
            .rows
            .get(table)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|r| !self.is_deleted(table, r.pk()))
            .cloned()
            .collect();
        rows.extend(
            self.inserts
                .iter()
                .filter(|(t, _)| t == table)
                .map(|(_, r)| r.clone()),
        );
        sort_rows(&mut rows, order_by);
        rows
    }

    fn release_locks(&mut self, tables: &mut Tables) {
        for key in self.held.drain() {
            if tables.locks.get(&key) == Some(&self.id) {
                tables.locks.remove(&key);
            }
        }
    }

    fn injected_conflict(&self) -> Result<(), StoreError> {
        if self.shared.take_injected_conflict() {
            return Err(StoreError::conflict("40P01", "deadlock detected"));
        }
        Ok(())
    }
}

impl StoreSession for InMemorySession {
    fn insert(&mut self, schema: &TableSchema, row: Row) -> Result<(), StoreError> {
        row.pk().check_against(schema.primary_key())?;
        let table = schema.name();
        let shared = Arc::clone(&self.shared);
        let tables = shared.lock_tables()?;

        let committed = tables.contains(table, row.pk()) && !self.is_deleted(table, row.pk());
        if committed || self.own_insert(table, row.pk()).is_some() {
            return Err(StoreError::IntegrityViolation(format!(
                "duplicate key {} in \"{table}\"",
                row.pk()
            )));
        }
        self.inserts.push((table.to_string(), row));
        Ok(())
    }

    fn query(&mut self, schema: &TableSchema, order_by: &[OrderBy], limit: Option<usize>) -> Result<Vec<Row>, StoreError> {
        let tables = self.shared.lock_tables()?;
        let mut rows = self.visible(&tables, schema.name(), order_by);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn query_pks(
        &mut self,
        schema: &TableSchema,
        order_by: &[OrderBy],
        limit: Option<usize>,
    ) -> Result<Vec<PrimaryKey>, StoreError> {
        Ok(self
            .query(schema, order_by, limit)?
            .into_iter()
            .map(|r| r.pk().clone())
            .collect())
    }

    fn lock_for_update(&mut self, schema: &TableSchema, pks: &[PrimaryKey]) -> Result<Vec<Row>, StoreError> {
        self.injected_conflict()?;
        let table = schema.name();
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.lock_tables()?;

        let mut locked = Vec::with_capacity(pks.len());
        for pk in pks {
            if let Some(row) = self.own_insert(table, pk) {
                locked.push(row.clone());
                continue;
            }
            if self.is_deleted(table, pk) || !tables.contains(table, pk) {
                continue;
            }
            let key = (table.to_string(), pk.clone());
            let (guard, _) = acquire(&shared, tables, self.id, &key, false)?;
            tables = guard;
            self.held.insert(key);
            // The previous owner may have deleted it.
            if let Some(row) = tables.get(table, pk) {
                locked.push(row.clone());
            }
        }
        Ok(locked)
    }

    fn query_for_update(
        &mut self,
        schema: &TableSchema,
        order_by: &[OrderBy],
        limit: Option<usize>,
        skip_locked: bool,
    ) -> Result<Vec<Row>, StoreError> {
        self.injected_conflict()?;
        let table = schema.name();
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.lock_tables()?;
        let candidates = self.visible(&tables, table, order_by);

        let mut locked = Vec::new();
        for row in candidates {
            if limit.is_some_and(|l| locked.len() >= l) {
                break;
            }
            if self.own_insert(table, row.pk()).is_some() {
                locked.push(row);
                continue;
            }
            let key = (table.to_string(), row.pk().clone());
            let (guard, acquired) = acquire(&shared, tables, self.id, &key, skip_locked)?;
            tables = guard;
            if !acquired {
                continue;
            }
            self.held.insert(key);
            if let Some(current) = tables.get(table, row.pk()) {
                locked.push(current.clone());
            }
        }
        Ok(locked)
    }

    fn delete(&mut self, schema: &TableSchema, pk: &PrimaryKey) -> Result<bool, StoreError> {
        let table = schema.name();
        if let Some(idx) = self
            .inserts
            .iter()
            .position(|(t, r)| t == table && r.pk() == pk)
        {
            self.inserts.remove(idx);
            return Ok(true);
        }
        if self.is_deleted(table, pk) {
            return Ok(false);
        }

        let shared = Arc::clone(&self.shared);
        let tables = shared.lock_tables()?;
        if !tables.contains(table, pk) {
            return Ok(false);
        }
        let key = (table.to_string(), pk.clone());
        let (tables, _) = acquire(&shared, tables, self.id, &key, false)?;
        self.held.insert(key.clone());
        if !tables.contains(table, pk) {
            return Ok(false);
        }
        self.deletes.insert(key);
        Ok(true)
    }

    fn count(&mut self, schema: &TableSchema) -> Result<u64, StoreError> {
        let tables = self.shared.lock_tables()?;
        Ok(self.visible(&tables, schema.name(), &[]).len() as u64)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.lock_tables()?;

        let duplicate = self.inserts.iter().find(|(table, row)| {
            tables.contains(table, row.pk()) && !self.is_deleted(table, row.pk())
        });
        if let Some((table, row)) = duplicate {
            let err = StoreError::IntegrityViolation(format!("duplicate key {} in \"{table}\"", row.pk()));
            self.inserts.clear();
            self.deletes.clear();
            self.release_locks(&mut tables);
            drop(tables);
            shared.released.notify_all();
            return Err(err);
        }

        for (table, pk) in self.deletes.drain() {
            if let Some(rows) = tables.rows.get_mut(&table) {
                rows.remove(&pk);
            }
        }
        for (table, row) in self.inserts.drain(..) {
            tables.rows.entry(table).or_default().insert(row.pk().clone(), row);
        }
        self.release_locks(&mut tables);
        drop(tables);
        shared.released.notify_all();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.inserts.clear();
        self.deletes.clear();
        if self.held.is_empty() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.lock_tables()?;
        self.release_locks(&mut tables);
        drop(tables);
        shared.released.notify_all();
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        let _ = self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signalbus_core::KeyColumn;
    use std::thread;

    const KEY: &[KeyColumn] = &[KeyColumn::int("id")];
    const SCHEMA: TableSchema = TableSchema::new("job_signal", KEY);

    fn row(id: i64, priority: i64) -> Row {
        SCHEMA
            .row_from_json(json!({"id": id, "priority": priority}))
            .unwrap()
    }

    fn pk(id: i64) -> PrimaryKey {
        PrimaryKey::single(id)
    }

    #[test]
    fn uncommitted_inserts_are_private() {
        let store = InMemoryRowStore::new();
        let mut a = store.open_session().unwrap();
        let mut b = store.open_session().unwrap();

        a.insert(&SCHEMA, row(1, 0)).unwrap();
        assert_eq!(a.count(&SCHEMA).unwrap(), 1);
        assert_eq!(b.count(&SCHEMA).unwrap(), 0);

        a.commit().unwrap();
        assert_eq!(b.count(&SCHEMA).unwrap(), 1);
        assert_eq!(store.row_count("job_signal"), 1);
    }

    #[test]
    fn rollback_and_drop_discard_changes() {
        let store = InMemoryRowStore::new();
        {
            let mut s = store.open_session().unwrap();
            s.insert(&SCHEMA, row(1, 0)).unwrap();
            s.rollback().unwrap();
            s.insert(&SCHEMA, row(2, 0)).unwrap();
        }
        assert_eq!(store.row_count("job_signal"), 0);
    }

    #[test]
    fn duplicate_keys_violate_integrity() {
        let store = InMemoryRowStore::new();
        store.insert_committed(&SCHEMA, [row(1, 0)]).unwrap();

        let mut s = store.open_session().unwrap();
        assert!(matches!(
            s.insert(&SCHEMA, row(1, 5)),
            Err(StoreError::IntegrityViolation(_))
        ));

        // Both sessions insert the same new key; the second commit fails.
        let mut a = store.open_session().unwrap();
        let mut b = store.open_session().unwrap();
        a.insert(&SCHEMA, row(2, 0)).unwrap();
        b.insert(&SCHEMA, row(2, 0)).unwrap();
        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(StoreError::IntegrityViolation(_))));
        assert_eq!(store.row_count("job_signal"), 2);
    }

    #[test]
    fn queries_sort_by_order_then_key() {
        let store = InMemoryRowStore::new();
        store
            .insert_committed(&SCHEMA, [row(1, 3), row(2, 1), row(3, 2)])
            .unwrap();
        let mut s = store.open_session().unwrap();

        let by_key = s.query_pks(&SCHEMA, &[], None).unwrap();
        assert_eq!(by_key, vec![pk(1), pk(2), pk(3)]);

        let by_priority = s
            .query_pks(&SCHEMA, &[OrderBy::asc("priority")], Some(2))
            .unwrap();
        assert_eq!(by_priority, vec![pk(2), pk(3)]);
    }

    #[test]
    fn lock_for_update_keeps_order_and_omits_missing() {
        let store = InMemoryRowStore::new();
        store.insert_committed(&SCHEMA, [row(1, 0), row(2, 0)]).unwrap();
        let mut s = store.open_session().unwrap();

        let locked = s.lock_for_update(&SCHEMA, &[pk(2), pk(9), pk(1)]).unwrap();
        let ids: Vec<_> = locked.iter().map(|r| r.pk().clone()).collect();
        assert_eq!(ids, vec![pk(2), pk(1)]);
    }

    #[test]
    fn skip_locked_passes_over_rows_held_elsewhere() {
        let store = InMemoryRowStore::new();
        store
            .insert_committed(&SCHEMA, (1..=4).map(|i| row(i, 0)))
            .unwrap();
        let mut a = store.open_session().unwrap();
        let mut b = store.open_session().unwrap();

        let first = a.query_for_update(&SCHEMA, &[], Some(2), true).unwrap();
        let second = b.query_for_update(&SCHEMA, &[], Some(10), true).unwrap();

        let first: Vec<_> = first.iter().map(|r| r.pk().clone()).collect();
        let second: Vec<_> = second.iter().map(|r| r.pk().clone()).collect();
        assert_eq!(first, vec![pk(1), pk(2)]);
        assert_eq!(second, vec![pk(3), pk(4)]);
    }

    #[test]
    fn lock_wait_sees_concurrent_delete() {
        let store = InMemoryRowStore::new();
        store.insert_committed(&SCHEMA, [row(1, 0)]).unwrap();

        let mut a = store.open_session().unwrap();
        assert!(a.delete(&SCHEMA, &pk(1)).unwrap());

        let waiter = {
            let store = store.clone();
            thread::spawn(move || {
                let mut b = store.open_session().unwrap();
                b.lock_for_update(&SCHEMA, &[pk(1)]).unwrap().len()
            })
        };
        thread::sleep(Duration::from_millis(50));
        a.commit().unwrap();

        assert_eq!(waiter.join().unwrap(), 0);
        assert_eq!(store.row_count("job_signal"), 0);
    }

    #[test]
    fn lock_timeout_is_a_conflict() {
        let store = InMemoryRowStore::with_lock_timeout(Duration::from_millis(20));
        store.insert_committed(&SCHEMA, [row(1, 0)]).unwrap();

        let mut a = store.open_session().unwrap();
        let mut b = store.open_session().unwrap();
        a.lock_for_update(&SCHEMA, &[pk(1)]).unwrap();

        let err = b.lock_for_update(&SCHEMA, &[pk(1)]).unwrap_err();
        assert!(matches!(err, StoreError::SerializationConflict { ref code, .. } if code == "55P03"));
    }

    #[test]
    fn injected_conflicts_are_consumed() {
        let store = InMemoryRowStore::new();
        store.inject_conflicts(1);
        let mut s = store.open_session().unwrap();

        assert!(s.lock_for_update(&SCHEMA, &[pk(1)]).is_err());
        assert!(s.lock_for_update(&SCHEMA, &[pk(1)]).unwrap().is_empty());
    }
}
