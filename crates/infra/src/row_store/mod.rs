//! Transactional row store boundary.
//!
//! The dispatcher never talks to a database directly. It opens a
//! [`StoreSession`] and uses a handful of primitives (query, lock, delete,
//! commit, rollback) that every backend provides with standard row-locking
//! semantics.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryRowStore;
pub use postgres::PostgresRowStore;
pub use r#trait::{CONFLICT_CODES, ConflictAware, RowStore, StoreError, StoreSession};
