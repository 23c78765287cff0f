//! Manifest-driven signal model.

use signalbus_bus::{Message, Publisher};
use signalbus_core::{Row, SignalSettings, TableSchema};

use super::{DeliveryError, SignalModel};

/// A signal table described at runtime rather than by a Rust type.
///
/// Each row is published as a JSON message whose body is the whole row and
/// whose `signal` header names the table.
#[derive(Debug, Clone)]
pub struct JsonSignalModel {
    schema: TableSchema,
    settings: SignalSettings,
    exchange: String,
    routing_key: String,
}

impl JsonSignalModel {
    /// Publish to `routing_key` on the default exchange.
    pub fn new(schema: TableSchema, routing_key: impl Into<String>) -> Self {
        Self {
            schema,
            settings: SignalSettings::default(),
            exchange: String::new(),
            routing_key: routing_key.into(),
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_settings(mut self, settings: SignalSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn message(&self, row: &Row) -> Message {
        Message::json(self.exchange.clone(), self.routing_key.clone(), row.to_json())
            .with_header("signal", self.schema.name())
    }
}

impl SignalModel for JsonSignalModel {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn settings(&self) -> &SignalSettings {
        &self.settings
    }

    fn send_one(&self, row: &Row, publisher: &dyn Publisher) -> Result<(), DeliveryError> {
        publisher.publish(self.message(row))?;
        Ok(())
    }

    fn send_batch(&self, rows: &[Row], publisher: &dyn Publisher) -> Result<(), DeliveryError> {
        publisher.publish_batch(rows.iter().map(|row| self.message(row)).collect())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signalbus_bus::InMemoryPublisher;
    use signalbus_core::KeyColumn;

    #[test]
    fn rows_become_json_messages() {
        let schema = TableSchema::owned("job_signal", vec![KeyColumn::int("id")]);
        let model = JsonSignalModel::new(schema.clone(), "jobs")
            .with_exchange("smartcoop")
            .with_settings(SignalSettings::default().with_burst_count(10));
        let publisher = InMemoryPublisher::new();
        let rows: Vec<Row> = (1..=3)
            .map(|id| schema.row_from_json(json!({"id": id, "name": "x"})).unwrap())
            .collect();

        model.send_batch(&rows, &publisher).unwrap();

        let delivered = publisher.delivered();
        assert_eq!(publisher.batch_sizes(), vec![3]);
        assert_eq!(delivered[0].exchange(), "smartcoop");
        assert_eq!(delivered[0].routing_key(), "jobs");
        assert_eq!(delivered[0].header("signal"), Some("job_signal"));
        assert_eq!(delivered[2].body(), &json!({"id": 3, "name": "x"}));
    }
}
