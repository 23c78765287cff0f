//! Signal models: outbox row types that know how to deliver themselves.
//!
//! Application code implements [`Signal`] for each outbox table. The
//! dispatcher works with the type-erased [`SignalModel`] view so typed
//! signals and manifest-driven ones ([`JsonSignalModel`]) are handled alike.

pub mod json;
pub mod registry;

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use signalbus_bus::{PublishError, Publisher};
use signalbus_core::{KeyColumn, Row, RowError, SignalSettings, TableSchema};

pub use json::JsonSignalModel;
pub use registry::{Selection, SignalRegistry};

/// Failure reported by a delivery callback.
///
/// Delivery failures are never retried by the dispatcher; the row stays
/// pending and is picked up by a later flush.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Row(#[from] RowError),

    #[error("{0}")]
    Failed(String),
}

impl DeliveryError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// A typed outbox row.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct JobCreated { id: i64, name: String }
///
/// impl Signal for JobCreated {
///     const TABLE: &'static str = "job_created_signal";
///     const PRIMARY_KEY: &'static [KeyColumn] = &[KeyColumn::int("id")];
///
///     fn send_signal(&self, publisher: &dyn Publisher) -> Result<(), DeliveryError> {
///         publisher.publish(Message::json("jobs", "job.created", serde_json::to_value(self)?))?;
///         Ok(())
///     }
/// }
/// ```
pub trait Signal: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table holding pending rows of this type. Also the signal's name.
    const TABLE: &'static str;

    /// Primary key columns, in key order.
    const PRIMARY_KEY: &'static [KeyColumn];

    /// Type-level dispatch settings.
    fn settings() -> SignalSettings {
        SignalSettings::default()
    }

    /// Deliver this row's message. An error leaves the row pending.
    fn send_signal(&self, publisher: &dyn Publisher) -> Result<(), DeliveryError>;

    /// Deliver several rows at once.
    ///
    /// Called with up to `burst_count` rows when `burst_count > 1`. Override
    /// to turn the rows into one network round trip.
    fn send_signals(batch: &[Self], publisher: &dyn Publisher) -> Result<(), DeliveryError> {
        for signal in batch {
            signal.send_signal(publisher)?;
        }
        Ok(())
    }

    fn schema() -> TableSchema {
        TableSchema::new(Self::TABLE, Self::PRIMARY_KEY)
    }
}

/// Encode a typed signal as a row of its table.
pub fn encode<S: Signal>(signal: &S) -> Result<Row, RowError> {
    let value = serde_json::to_value(signal).map_err(|e| RowError::Serialize(e.to_string()))?;
    S::schema().row_from_json(value)
}

/// Decode a stored row into its typed signal.
pub fn decode<S: Signal>(row: &Row) -> Result<S, RowError> {
    serde_json::from_value(row.to_json()).map_err(|e| RowError::Deserialize(e.to_string()))
}

/// Type-erased signal type, as seen by the dispatcher and the registry.
pub trait SignalModel: Send + Sync {
    fn schema(&self) -> &TableSchema;

    fn settings(&self) -> &SignalSettings;

    fn name(&self) -> &str {
        self.schema().name()
    }

    fn send_one(&self, row: &Row, publisher: &dyn Publisher) -> Result<(), DeliveryError>;

    fn send_batch(&self, rows: &[Row], publisher: &dyn Publisher) -> Result<(), DeliveryError> {
        for row in rows {
            self.send_one(row, publisher)?;
        }
        Ok(())
    }
}

/// [`SignalModel`] view of a [`Signal`] implementation.
pub struct TypedSignalModel<S> {
    schema: TableSchema,
    settings: SignalSettings,
    _signal: PhantomData<fn() -> S>,
}

impl<S: Signal> TypedSignalModel<S> {
    pub fn new() -> Self {
        Self {
            schema: S::schema(),
            settings: S::settings(),
            _signal: PhantomData,
        }
    }
}

impl<S: Signal> Default for TypedSignalModel<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Signal> SignalModel for TypedSignalModel<S> {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn settings(&self) -> &SignalSettings {
        &self.settings
    }

    fn send_one(&self, row: &Row, publisher: &dyn Publisher) -> Result<(), DeliveryError> {
        decode::<S>(row)?.send_signal(publisher)
    }

    fn send_batch(&self, rows: &[Row], publisher: &dyn Publisher) -> Result<(), DeliveryError> {
        let batch = rows.iter().map(decode::<S>).collect::<Result<Vec<_>, _>>()?;
        S::send_signals(&batch, publisher)
    }
}
