use thiserror::Error;

use signalbus_core::{OrderBy, PrimaryKey, Row, RowError, TableSchema};

/// SQLSTATE codes (and in-memory equivalents) treated as serialization conflicts.
pub const CONFLICT_CODES: &[&str] = &["40001", "40P01", "55P03"];

/// Errors raised by a row store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Serialization failure, deadlock or lock timeout. Safe to retry after rollback.
    #[error("serialization conflict (SQLSTATE {code}): {message}")]
    SerializationConflict { code: String, message: String },

    /// Unique/foreign-key/check constraint violation.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("unknown table `{0}`")]
    UnknownTable(String),

    /// A stored row could not be decoded.
    #[error(transparent)]
    Row(#[from] RowError),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SerializationConflict {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Classifier used by the retry policy.
pub trait ConflictAware {
    /// True when the failed unit of work may succeed if re-run after a rollback.
    fn is_serialization_conflict(&self) -> bool;
}

impl ConflictAware for StoreError {
    fn is_serialization_conflict(&self) -> bool {
        matches!(self, StoreError::SerializationConflict { .. })
    }
}

/// A transactional connection to the row store.
///
/// A session always has one ambient transaction open. Every operation takes
/// part in it; [`commit`](Self::commit) and [`rollback`](Self::rollback) end it
/// and the next operation starts a fresh one.
///
/// ## Visibility
///
/// Reads see committed rows plus this session's own uncommitted inserts and
/// deletes (read committed).
///
/// ## Locking
///
/// `lock_for_update` and `query_for_update` take row-level exclusive locks held
/// until the transaction ends. Rows that vanished before the lock was granted
/// are silently left out.
pub trait StoreSession: Send {
    fn insert(&mut self, schema: &TableSchema, row: Row) -> Result<(), StoreError>;

    /// Read rows, sorted by `order_by` (primary key order when empty).
    fn query(
        &mut self,
        schema: &TableSchema,
        order_by: &[OrderBy],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StoreError>;

    /// Read only primary keys, sorted like [`query`](Self::query). Takes no locks.
    fn query_pks(
        &mut self,
        schema: &TableSchema,
        order_by: &[OrderBy],
        limit: Option<usize>,
    ) -> Result<Vec<PrimaryKey>, StoreError>;

    /// Lock the rows with the given keys.
    ///
    /// The result keeps the order of `pks`; missing rows are omitted.
    fn lock_for_update(&mut self, schema: &TableSchema, pks: &[PrimaryKey]) -> Result<Vec<Row>, StoreError>;

    /// Read and lock up to `limit` rows.
    ///
    /// With `skip_locked`, rows locked by other transactions are passed over
    /// instead of waited for.
    fn query_for_update(
        &mut self,
        schema: &TableSchema,
        order_by: &[OrderBy],
        limit: Option<usize>,
        skip_locked: bool,
    ) -> Result<Vec<Row>, StoreError>;

    /// Delete one row; returns `false` when it was already gone.
    fn delete(&mut self, schema: &TableSchema, pk: &PrimaryKey) -> Result<bool, StoreError>;

    fn count(&mut self, schema: &TableSchema) -> Result<u64, StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Drop any cached row state so the next read goes to the store.
    fn expire_all(&mut self) {}
}

/// Factory for sessions over one database.
pub trait RowStore: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError>;
}

impl<S> RowStore for std::sync::Arc<S>
where
    S: RowStore + ?Sized,
{
    fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        (**self).open_session()
    }
}
