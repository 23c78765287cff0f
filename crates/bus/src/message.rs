use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A message handed to the bus.
///
/// Notes:
/// - `exchange` + `routing_key` address the message (AMQP-style); brokers
///   without exchanges use only the routing key.
/// - `body` is the JSON payload; `content_type` describes its encoding.
/// - `message_id` is fresh per message, so consumers can de-duplicate
///   redeliveries (delivery is at-least-once).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    message_id: Uuid,
    exchange: String,
    routing_key: String,
    content_type: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,

    created_at: DateTime<Utc>,
    body: JsonValue,
}

impl Message {
    /// Build a JSON message.
    pub fn json(exchange: impl Into<String>, routing_key: impl Into<String>, body: JsonValue) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            content_type: "application/json".to_string(),
            headers: BTreeMap::new(),
            created_at: Utc::now(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn body(&self) -> &JsonValue {
        &self.body
    }

    pub fn into_body(self) -> JsonValue {
        self.body
    }
}
