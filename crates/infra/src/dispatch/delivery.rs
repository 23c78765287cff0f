//! The delivery procedure shared by every flush strategy.

use std::collections::HashSet;

use signalbus_bus::Publisher;
use signalbus_core::{OrderBy, PrimaryKey, Row};

use crate::error::SignalBusError;
use crate::row_store::StoreSession;
use crate::signal::SignalModel;

/// Outcome of one delivery pass over a signal type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Delivered {
    /// Candidate keys listed (before filtering).
    pub listed: usize,
    /// Rows delivered and deleted.
    pub sent: usize,
}

/// Hand `rows` to the model's delivery callback.
///
/// Types with `burst_count > 1` get their bulk callback.
pub(crate) fn send(model: &dyn SignalModel, rows: &[Row], publisher: &dyn Publisher) -> Result<(), SignalBusError> {
    let result = if model.settings().burst_count > 1 {
        model.send_batch(rows, publisher)
    } else {
        rows.iter().try_for_each(|row| model.send_one(row, publisher))
    };
    result.map_err(|e| SignalBusError::delivery(model.name(), e))
}

/// List candidate keys, then lock, send, delete and commit them
/// `burst_count` rows at a time.
///
/// - `admissible` restricts candidates to a snapshot.
/// - `order_by` sorts candidates; delivery follows that order.
/// - `limit` caps the number of keys listed.
///
/// Rows that vanished between listing and locking were handled by someone
/// else and are skipped. On any error the open chunk is rolled back, so its
/// rows stay pending.
pub(crate) fn deliver(
    session: &mut dyn StoreSession,
    model: &dyn SignalModel,
    publisher: &dyn Publisher,
    admissible: Option<&HashSet<PrimaryKey>>,
    order_by: &[OrderBy],
    limit: Option<usize>,
) -> Result<Delivered, SignalBusError> {
    let result = deliver_chunks(session, model, publisher, admissible, order_by, limit);
    if result.is_err() {
        let _ = session.rollback();
    }
    result
}

fn deliver_chunks(
    session: &mut dyn StoreSession,
    model: &dyn SignalModel,
    publisher: &dyn Publisher,
    admissible: Option<&HashSet<PrimaryKey>>,
    order_by: &[OrderBy],
    limit: Option<usize>,
) -> Result<Delivered, SignalBusError> {
    let schema = model.schema();
    let burst = model.settings().burst_count.max(1);

    let listed = session.query_pks(schema, order_by, limit)?;
    session.commit()?;

    let mut delivered = Delivered {
        listed: listed.len(),
        sent: 0,
    };
    let candidates: Vec<PrimaryKey> = match admissible {
        Some(snapshot) => listed.into_iter().filter(|pk| snapshot.contains(pk)).collect(),
        None => listed,
    };

    for chunk in candidates.chunks(burst) {
        let rows = session.lock_for_update(schema, chunk)?;
        if rows.is_empty() {
            session.commit()?;
            continue;
        }
        send(model, &rows, publisher)?;
        for row in &rows {
            session.delete(schema, row.pk())?;
        }
        session.commit()?;
        session.expire_all();
        delivered.sent += rows.len();
        tracing::debug!(signal = %model.name(), count = rows.len(), "chunk delivered");
    }
    Ok(delivered)
}

/// Claim up to `claim` rows with `SKIP LOCKED`, send them as one chunk,
/// delete them, commit.
///
/// On error the claim is rolled back and none of its rows are deleted.
pub(crate) fn deliver_claimed(
    session: &mut dyn StoreSession,
    model: &dyn SignalModel,
    publisher: &dyn Publisher,
    claim: usize,
) -> Result<Delivered, SignalBusError> {
    let result = deliver_claim(session, model, publisher, claim);
    if result.is_err() {
        let _ = session.rollback();
    }
    result
}

fn deliver_claim(
    session: &mut dyn StoreSession,
    model: &dyn SignalModel,
    publisher: &dyn Publisher,
    claim: usize,
) -> Result<Delivered, SignalBusError> {
    let schema = model.schema();

    let rows = session.query_for_update(schema, &[], Some(claim), true)?;
    if rows.is_empty() {
        session.commit()?;
        return Ok(Delivered::default());
    }
    send(model, &rows, publisher)?;
    for row in &rows {
        session.delete(schema, row.pk())?;
    }
    session.commit()?;
    session.expire_all();
    Ok(Delivered {
        listed: rows.len(),
        sent: rows.len(),
    })
}
