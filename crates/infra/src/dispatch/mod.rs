//! Outbox dispatch engine.
//!
//! [`SignalBus`] moves pending signal rows to the message bus. Rows are
//! always re-read from the store (never dispatched from in-memory copies), a
//! row is deleted in the same transaction that recorded its delivery, and
//! delivery is therefore **at-least-once**.
//!
//! ## Strategies
//!
//! | Operation | Use | Concurrent dispatchers |
//! |-----------|-----|------------------------|
//! | [`flush`](SignalBus::flush) | small backlogs, after autoflush | snapshot, then wait; a timing heuristic |
//! | [`flushmany`](SignalBus::flushmany) | huge backlogs after an outage | `FOR UPDATE SKIP LOCKED` bursts; safe |
//! | [`flushordered`](SignalBus::flushordered) | types with `order_by` | not supported; run one at a time |
//!
//! ## Error Handling
//!
//! Serialization conflicts are rolled back and retried under the configured
//! [`RetryPolicy`]; exhausting it yields
//! [`SignalBusError::DeadlockExceeded`]. Delivery failures are never retried:
//! the open chunk is rolled back (its rows stay pending) and the error is
//! returned. Either way the remaining types are not attempted.
//!
//! Commit-triggered dispatch (autoflush) goes through
//! [`AutoflushObserver`], which logs failures per type instead.

mod autoflush;
mod delivery;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use signalbus_bus::Publisher;
use signalbus_core::PrimaryKey;

use crate::config::SignalBusConfig;
use crate::error::{ConfigurationError, SignalBusError};
use crate::retry::{RetryError, RetryPolicy};
use crate::row_store::{ConflictAware, RowStore, StoreSession};
use crate::signal::{Selection, SignalModel, SignalRegistry};
use crate::unit_of_work::Database;

pub use autoflush::AutoflushObserver;

/// Number of pending rows of one signal type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCount {
    pub signal: String,
    pub count: u64,
}

/// The dispatcher: a row store, the registered signal types and a publisher.
pub struct SignalBus {
    store: Arc<dyn RowStore>,
    registry: SignalRegistry,
    publisher: Arc<dyn Publisher>,
    config: SignalBusConfig,
    autoflush: AtomicBool,
    observer: OnceLock<Arc<AutoflushObserver>>,
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("autoflush", &self.autoflush())
            .finish_non_exhaustive()
    }
}

impl SignalBus {
    pub fn new(store: Arc<dyn RowStore>, registry: SignalRegistry, publisher: Arc<dyn Publisher>) -> Self {
        Self::with_config(store, registry, publisher, SignalBusConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn RowStore>,
        registry: SignalRegistry,
        publisher: Arc<dyn Publisher>,
        config: SignalBusConfig,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            autoflush: AtomicBool::new(config.autoflush),
            config,
            observer: OnceLock::new(),
        }
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SignalBusConfig {
        &self.config
    }

    /// Whether commits dispatch their new signals inline.
    pub fn autoflush(&self) -> bool {
        self.autoflush.load(Ordering::SeqCst)
    }

    /// Turn commit-triggered dispatch on or off for every type.
    ///
    /// Pending-sets are still cleared on commit while disabled.
    pub fn set_autoflush(&self, enabled: bool) {
        self.autoflush.store(enabled, Ordering::SeqCst);
    }

    /// Install this bus as the commit hook of `database`.
    ///
    /// Attaching the same bus twice is a no-op; a database accepts only one bus.
    pub fn attach(self: &Arc<Self>, database: &Database) -> Result<(), ConfigurationError> {
        let observer = self
            .observer
            .get_or_init(|| Arc::new(AutoflushObserver::new(Arc::downgrade(self))));
        database.attach_observer(observer.clone())
    }

    /// Send pending signals of the selected types.
    ///
    /// Snapshots the primary keys present now, waits `wait` so concurrent
    /// autoflush dispatchers can finish, then delivers only snapshotted rows.
    /// Returns the number of rows delivered.
    pub fn flush(&self, selection: &Selection, wait: Duration) -> Result<usize, SignalBusError> {
        let models = self.registry.resolve(selection)?;
        let mut session = self.store.open_session()?;

        let mut snapshots: Vec<HashSet<PrimaryKey>> = Vec::with_capacity(models.len());
        for model in &models {
            let pks = session.query_pks(model.schema(), &[], None);
            match pks {
                Ok(pks) => snapshots.push(pks.into_iter().collect()),
                Err(e) => {
                    let _ = session.rollback();
                    return Err(e.into());
                }
            }
        }
        session.rollback()?;

        if snapshots.iter().all(HashSet::is_empty) {
            return Ok(0);
        }
        if !wait.is_zero() {
            thread::sleep(wait);
        }

        let mut total = 0;
        for (model, snapshot) in models.iter().zip(&snapshots) {
            if snapshot.is_empty() {
                continue;
            }
            tracing::info!(signal = %model.name(), "flushing signals");
            let order_by = &model.settings().order_by;
            let delivered = self.with_retry(&self.config.flush_retry, model.as_ref(), &mut session, |s| {
                delivery::deliver(s, model.as_ref(), self.publisher.as_ref(), Some(snapshot), order_by, None)
            })?;
            total += delivered.sent;
        }
        Ok(total)
    }

    /// Send a potentially huge number of pending signals.
    ///
    /// Claims one burst at a time with `SKIP LOCKED` (`burst_count` rows,
    /// capped by `flushmany_limit`) and commits it before claiming the next,
    /// until a claim comes back short. Several processes can run this
    /// concurrently on the same tables, and a failing row only holds back
    /// its own burst.
    pub fn flushmany(&self, selection: &Selection) -> Result<usize, SignalBusError> {
        let models = self.registry.resolve(selection)?;
        let mut session = self.store.open_session()?;

        let mut total = 0;
        for model in &models {
            tracing::warn!(signal = %model.name(), "flushing signals in \"flushmany\" mode");
            let claim = model
                .settings()
                .burst_count
                .min(self.config.flushmany_limit)
                .max(1);
            loop {
                let burst = self.with_retry(&self.config.page_retry, model.as_ref(), &mut session, |s| {
                    delivery::deliver_claimed(s, model.as_ref(), self.publisher.as_ref(), claim)
                })?;
                total += burst.sent;
                if burst.listed < claim {
                    break;
                }
            }
        }
        Ok(total)
    }

    /// Send pending signals in their declared order.
    ///
    /// Candidates are re-queried in `order_by` order (primary key order for
    /// types without one) on every page, so delivery order holds across the
    /// whole run. Only one ordered dispatcher should run at a time.
    pub fn flushordered(&self, selection: &Selection) -> Result<usize, SignalBusError> {
        let models = self.registry.resolve(selection)?;
        let limit = self.config.flushordered_limit.max(1);
        let mut session = self.store.open_session()?;

        let mut total = 0;
        for model in &models {
            tracing::info!(signal = %model.name(), "flushing signals in order");
            let order_by = if model.settings().is_ordered() {
                model.settings().order_by.clone()
            } else {
                model.schema().key_order()
            };
            loop {
                let page = self.with_retry(&self.config.page_retry, model.as_ref(), &mut session, |s| {
                    delivery::deliver(s, model.as_ref(), self.publisher.as_ref(), None, &order_by, Some(limit))
                })?;
                total += page.sent;
                if page.listed < limit {
                    break;
                }
            }
        }
        Ok(total)
    }

    /// Count pending rows of every registered type.
    pub fn pending(&self) -> Result<Vec<PendingCount>, SignalBusError> {
        let mut session = self.store.open_session()?;
        let mut counts = Vec::with_capacity(self.registry.len());
        for model in self.registry.signal_types() {
            counts.push(PendingCount {
                signal: model.name().to_string(),
                count: session.count(model.schema())?,
            });
        }
        session.rollback()?;
        Ok(counts)
    }

    /// Deliver every pending row of one type, as done after a commit.
    pub(crate) fn autoflush_type(&self, model: &dyn SignalModel) -> Result<usize, SignalBusError> {
        let mut session = self.store.open_session()?;
        let order_by = &model.settings().order_by;
        let delivered = self.with_retry(&self.config.flush_retry, model, &mut session, |s| {
            delivery::deliver(s, model, self.publisher.as_ref(), None, order_by, None)
        })?;
        Ok(delivered.sent)
    }

    fn with_retry<T>(
        &self,
        policy: &RetryPolicy,
        model: &dyn SignalModel,
        session: &mut Box<dyn StoreSession>,
        mut op: impl FnMut(&mut dyn StoreSession) -> Result<T, SignalBusError>,
    ) -> Result<T, SignalBusError> {
        policy
            .run_with(
                session,
                |e: &SignalBusError| e.is_serialization_conflict(),
                |s| {
                    let _ = s.rollback();
                },
                |s| op(s.as_mut()),
            )
            .map_err(|e| match e {
                RetryError::Fatal(e) => e,
                RetryError::Exhausted { attempts, source } => match source {
                    SignalBusError::Store(source) => {
                        tracing::error!(signal = %model.name(), attempts, "giving up on serialization conflicts");
                        SignalBusError::DeadlockExceeded {
                            signal: model.name().to_string(),
                            attempts,
                            source,
                        }
                    }
                    other => other,
                },
            })
    }
}
