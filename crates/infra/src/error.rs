//! Error taxonomy of the dispatcher.

use thiserror::Error;

use crate::row_store::{ConflictAware, StoreError};
use crate::signal::DeliveryError;

/// Misconfiguration. Raised immediately and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("`{0}` is not a signal type")]
    NotASignalType(String),

    #[error("signal type `{0}` is registered twice")]
    DuplicateSignalType(String),

    #[error("signal type `{name}` must have a positive burst_count")]
    InvalidBurstCount { name: String },

    #[error("can not attach more than one signal bus to one database")]
    ObserverAlreadyAttached,
}

/// Errors returned by the dispatch operations.
#[derive(Debug, Error)]
pub enum SignalBusError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A delivery callback failed; the affected rows were left pending.
    #[error("error while sending `{signal}`: {source}")]
    Delivery {
        signal: String,
        #[source]
        source: DeliveryError,
    },

    /// Serialization conflicts persisted past the retry budget.
    #[error("`{signal}` still conflicting after {attempts} attempts: {source}")]
    DeadlockExceeded {
        signal: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl SignalBusError {
    pub fn delivery(signal: impl Into<String>, source: DeliveryError) -> Self {
        Self::Delivery {
            signal: signal.into(),
            source,
        }
    }

    /// True for failures of the message bus (or a delivery callback).
    pub fn is_delivery_error(&self) -> bool {
        matches!(self, SignalBusError::Delivery { .. })
    }
}

impl ConflictAware for SignalBusError {
    fn is_serialization_conflict(&self) -> bool {
        match self {
            SignalBusError::Store(e) => e.is_serialization_conflict(),
            SignalBusError::DeadlockExceeded { .. } => true,
            _ => false,
        }
    }
}
