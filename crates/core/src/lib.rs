//! `signalbus-core`: data model shared by the outbox crates.
//!
//! This crate contains **pure** primitives (no I/O): primary keys, rows,
//! table metadata and per-type dispatch settings.

pub mod error;
pub mod key;
pub mod row;
pub mod settings;

pub use error::{RowError, RowResult};
pub use key::{KeyColumn, KeyKind, KeyValue, PrimaryKey};
pub use row::{Direction, OrderBy, Row, TableSchema};
pub use settings::SignalSettings;
