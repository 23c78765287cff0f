//! Type-level dispatch settings of a signal model.

use serde::{Deserialize, Serialize};

use crate::row::OrderBy;

/// Per-type knobs consulted by the dispatcher.
///
/// These belong to the signal *type*, never to an individual row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSettings {
    /// Rows delivered (and deleted) per committed sub-transaction. Must be positive.
    pub burst_count: usize,
    /// Delivery order for ordered flushing. Empty means unordered.
    pub order_by: Vec<OrderBy>,
    /// Whether a commit that created rows of this type dispatches them inline.
    pub autoflush: bool,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            burst_count: 1,
            order_by: Vec::new(),
            autoflush: true,
        }
    }
}

impl SignalSettings {
    pub fn with_burst_count(mut self, burst_count: usize) -> Self {
        self.burst_count = burst_count;
        self
    }

    pub fn with_order_by(mut self, order_by: impl IntoIterator<Item = OrderBy>) -> Self {
        self.order_by = order_by.into_iter().collect();
        self
    }

    pub fn with_autoflush(mut self, autoflush: bool) -> Self {
        self.autoflush = autoflush;
        self
    }

    pub fn is_ordered(&self) -> bool {
        !self.order_by.is_empty()
    }
}
