//! Infrastructure layer: row stores, the outbox dispatcher and bus sinks.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod publisher;
pub mod retry;
pub mod row_store;
pub mod signal;
pub mod unit_of_work;


pub use config::SignalBusConfig;
pub use dispatch::{AutoflushObserver, PendingCount, SignalBus};
pub use error::{ConfigurationError, SignalBusError};
pub use retry::{RetryError, RetryPolicy};
pub use row_store::{ConflictAware, InMemoryRowStore, PostgresRowStore, RowStore, StoreError, StoreSession};
pub use signal::{DeliveryError, JsonSignalModel, Selection, Signal, SignalModel, SignalRegistry, TypedSignalModel};
pub use unit_of_work::{Database, HookState, PendingSet, TransactionObserver, UnitOfWork};
