//! Commit hook that dispatches new signals inline.

use std::sync::Weak;

use crate::row_store::ConflictAware;
use crate::unit_of_work::{PendingSet, TransactionObserver};

use super::SignalBus;

/// Flushes the signal types a transaction created rows for, right after it
/// commits.
///
/// Failures are contained per type: a serialization conflict means another
/// dispatcher owns those rows and is logged at `debug`; anything else is
/// logged at `error`. Either way the remaining types are still flushed and the
/// committing caller never sees the error.
#[derive(Debug)]
pub struct AutoflushObserver {
    bus: Weak<SignalBus>,
}

impl AutoflushObserver {
    pub(crate) fn new(bus: Weak<SignalBus>) -> Self {
        Self { bus }
    }
}

impl TransactionObserver for AutoflushObserver {
    fn on_create(&self, pending: &mut PendingSet, table: &str) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        if bus.registry().get(table).is_ok_and(|model| model.settings().autoflush) {
            pending.insert(table);
        }
    }

    fn on_commit(&self, pending: PendingSet) {
        if pending.is_empty() {
            return;
        }
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        if !bus.autoflush() {
            tracing::debug!(types = pending.len(), "autoflush disabled; leaving signals pending");
            return;
        }

        for name in pending {
            let Ok(model) = bus.registry().get(&name) else {
                continue;
            };
            match bus.autoflush_type(model.as_ref()) {
                Ok(sent) => tracing::debug!(signal = %name, sent, "autoflush delivered signals"),
                Err(e) if e.is_serialization_conflict() => {
                    tracing::debug!(signal = %name, error = %e, "autoflush yielded to a concurrent dispatcher")
                }
                Err(e) => tracing::error!(signal = %name, error = %e, "caught error during autoflush"),
            }
        }
    }

    fn on_rollback(&self, pending: PendingSet) {
        if !pending.is_empty() {
            tracing::trace!(types = pending.len(), "discarding pending signals after rollback");
        }
    }
}
