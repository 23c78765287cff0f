//! Redis pub/sub-backed publisher (optional).
//!
//! Messages are published as JSON to the channel named by their routing key
//! (prefixed with the exchange when one is set). Redis pub/sub is not durable:
//! a message published while no subscriber listens is dropped, even though
//! the outbox row has been deleted. Use a broker with acknowledgements when
//! that matters.

use redis::Commands;

use signalbus_bus::{Message, PublishError, Publisher};

/// Redis pub/sub publisher for signal messages.
#[derive(Debug, Clone)]
pub struct RedisPublisher {
    client: redis::Client,
}

impl RedisPublisher {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, PublishError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn connection(&self) -> Result<redis::Connection, PublishError> {
        self.client
            .get_connection()
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}

/// Channel a message is published on.
pub fn channel_for(message: &Message) -> String {
    if message.exchange().is_empty() {
        message.routing_key().to_string()
    } else {
        format!("{}.{}", message.exchange(), message.routing_key())
    }
}

fn encode(message: &Message) -> Result<String, PublishError> {
    serde_json::to_string(message).map_err(|e| PublishError::Serialize(e.to_string()))
}

impl Publisher for RedisPublisher {
    fn publish(&self, message: Message) -> Result<(), PublishError> {
        let payload = encode(&message)?;
        let mut conn = self.connection()?;
        let _: i64 = conn
            .publish(channel_for(&message), payload)
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(())
    }

    fn publish_batch(&self, messages: Vec<Message>) -> Result<(), PublishError> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for message in &messages {
            pipe.cmd("PUBLISH")
                .arg(channel_for(message))
                .arg(encode(message)?)
                .ignore();
        }
        let mut conn = self.connection()?;
        pipe.query::<()>(&mut conn)
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_includes_exchange_when_set() {
        assert_eq!(channel_for(&Message::json("", "jobs", json!({}))), "jobs");
        assert_eq!(channel_for(&Message::json("smartcoop", "jobs", json!({}))), "smartcoop.jobs");
    }

    #[test]
    fn invalid_urls_are_transport_errors() {
        assert!(matches!(
            RedisPublisher::new("not a url"),
            Err(PublishError::Transport(_))
        ));
    }
}
