//! Units of work and the commit hook.
//!
//! A [`UnitOfWork`] wraps one store session transaction. Signal rows added
//! through it are reported to the attached [`TransactionObserver`], which
//! keeps a per-transaction [`PendingSet`] of signal *types*:
//!
//! ```text
//! Clean ──add(signal)──▶ Dirty ──commit──▶ on_commit(pending)   ──▶ Clean
//!                          │
//!                          └──rollback/drop──▶ on_rollback(pending) ──▶ Clean
//! ```
//!
//! The pending-set lives on the unit of work itself and is handed over by
//! value, so it is always empty once the transaction has ended.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use signalbus_core::{Row, TableSchema};

use crate::error::ConfigurationError;
use crate::retry::{RetryError, RetryPolicy};
use crate::row_store::{ConflictAware, RowStore, StoreError, StoreSession};
use crate::signal::{Signal, encode};

/// Signal types that received new rows in one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSet(BTreeSet<String>);

impl PendingSet {
    pub fn insert(&mut self, signal: impl Into<String>) -> bool {
        self.0.insert(signal.into())
    }

    pub fn contains(&self, signal: &str) -> bool {
        self.0.contains(signal)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl IntoIterator for PendingSet {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Commit hook state of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    /// No signal type pending.
    Clean,
    /// At least one signal type has uncommitted rows.
    Dirty,
}

/// Receives lifecycle callbacks from units of work.
pub trait TransactionObserver: Send + Sync {
    /// A row was added to `table` inside the transaction owning `pending`.
    fn on_create(&self, pending: &mut PendingSet, table: &str);

    /// The transaction committed.
    fn on_commit(&self, pending: PendingSet);

    /// The transaction rolled back (explicitly, on failed commit, or on drop).
    fn on_rollback(&self, pending: PendingSet) {
        drop(pending);
    }
}

/// Handle to a database: a row store plus the (optional) commit hook.
pub struct Database {
    store: Arc<dyn RowStore>,
    observer: RwLock<Option<Arc<dyn TransactionObserver>>>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            store,
            observer: RwLock::new(None),
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy used by [`atomic`](Self::atomic).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    /// Install the commit hook.
    ///
    /// Attaching the same observer again is a no-op; attaching a different
    /// one fails.
    pub fn attach_observer(&self, observer: Arc<dyn TransactionObserver>) -> Result<(), ConfigurationError> {
        let mut slot = self
            .observer
            .write()
            .map_err(|_| ConfigurationError::ObserverAlreadyAttached)?;
        match slot.as_ref() {
            Some(existing) if std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(&observer)) => Ok(()),
            Some(_) => Err(ConfigurationError::ObserverAlreadyAttached),
            None => {
                *slot = Some(observer);
                Ok(())
            }
        }
    }

    /// Start a unit of work.
    pub fn begin(&self) -> Result<UnitOfWork, StoreError> {
        let observer = self.observer.read().ok().and_then(|o| o.clone());
        Ok(UnitOfWork {
            session: self.store.open_session()?,
            observer,
            pending: PendingSet::default(),
            finished: false,
        })
    }

    /// Run `body` in a unit of work and commit it.
    ///
    /// `Err` from `body` rolls back. Serialization conflicts (from `body` or
    /// from the commit) re-run the whole block under the retry policy.
    pub fn atomic<T, E>(&self, mut body: impl FnMut(&mut UnitOfWork) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError> + ConflictAware,
    {
        self.retry
            .run(
                |e: &E| e.is_serialization_conflict(),
                || {
                    let mut uow = self.begin().map_err(E::from)?;
                    let value = body(&mut uow)?;
                    uow.commit().map_err(E::from)?;
                    Ok(value)
                },
            )
            .map_err(RetryError::into_inner)
    }
}

/// One transaction on a store session.
///
/// Dropping an unfinished unit of work rolls it back.
pub struct UnitOfWork {
    session: Box<dyn StoreSession>,
    observer: Option<Arc<dyn TransactionObserver>>,
    pending: PendingSet,
    finished: bool,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("pending", &self.pending)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    /// Add a signal row.
    pub fn add<S: Signal>(&mut self, signal: &S) -> Result<(), StoreError> {
        let row = encode(signal)?;
        self.insert_row(&S::schema(), row)
    }

    /// Add a raw row to `schema`'s table.
    pub fn insert_row(&mut self, schema: &TableSchema, row: Row) -> Result<(), StoreError> {
        self.session.insert(schema, row)?;
        if let Some(observer) = &self.observer {
            observer.on_create(&mut self.pending, schema.name());
        }
        Ok(())
    }

    /// The underlying session, for application reads and writes.
    pub fn session(&mut self) -> &mut dyn StoreSession {
        self.session.as_mut()
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    pub fn state(&self) -> HookState {
        if self.pending.is_empty() {
            HookState::Clean
        } else {
            HookState::Dirty
        }
    }

    /// Run `body`, reporting integrity violations as serialization conflicts.
    ///
    /// Inside [`Database::atomic`] this makes a racing duplicate insert
    /// re-run the whole block, which then observes the winner's row.
    pub fn retry_on_integrity_error<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        body(self).map_err(|e| match e {
            StoreError::IntegrityViolation(message) => StoreError::conflict("40001", message),
            other => other,
        })
    }

    /// Commit, then run the commit hook.
    ///
    /// A failed commit is rolled back and reported to the hook as a rollback.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        let pending = std::mem::take(&mut self.pending);
        let observer = self.observer.take();
        match self.session.commit() {
            Ok(()) => {
                if let Some(observer) = observer {
                    observer.on_commit(pending);
                }
                Ok(())
            }
            Err(err) => {
                let _ = self.session.rollback();
                if let Some(observer) = observer {
                    observer.on_rollback(pending);
                }
                Err(err)
            }
        }
    }

    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        let result = self.session.rollback();
        if let Some(observer) = self.observer.take() {
            observer.on_rollback(std::mem::take(&mut self.pending));
        }
        result
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let _ = self.session.rollback();
        if let Some(observer) = self.observer.take() {
            observer.on_rollback(std::mem::take(&mut self.pending));
        }
    }
}
