//! In-memory publisher for tests/dev.

use std::fmt;
use std::sync::Mutex;

use crate::message::Message;
use crate::publisher::{PublishError, Publisher};

type RejectFn = Box<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Default)]
struct State {
    delivered: Vec<Message>,
    batches: Vec<usize>,
}

/// In-memory publisher.
///
/// - No IO / no async
/// - Records every accepted message and the size of every publish call
/// - Optional rejection rule to simulate a failing broker
#[derive(Default)]
pub struct InMemoryPublisher {
    state: Mutex<State>,
    reject: Option<RejectFn>,
}

impl fmt::Debug for InMemoryPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryPublisher")
            .field("rejects", &self.reject.is_some())
            .finish_non_exhaustive()
    }
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every message matching `rule`.
    ///
    /// A batch containing a rejected message is rejected as a whole.
    pub fn rejecting(rule: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(State::default()),
            reject: Some(Box::new(rule)),
        }
    }

    /// Every accepted message, in publish order.
    pub fn delivered(&self) -> Vec<Message> {
        self.state
            .lock()
            .map(|s| s.delivered.clone())
            .unwrap_or_default()
    }

    /// Bodies of every accepted message, in publish order.
    pub fn delivered_bodies(&self) -> Vec<serde_json::Value> {
        self.delivered().into_iter().map(Message::into_body).collect()
    }

    /// Number of messages accepted by each successful publish call.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state
            .lock()
            .map(|s| s.batches.clone())
            .unwrap_or_default()
    }

    fn check(&self, message: &Message) -> Result<(), PublishError> {
        match &self.reject {
            Some(rule) if rule(message) => Err(PublishError::Rejected(format!(
                "{} {}",
                message.routing_key(),
                message.body()
            ))),
            _ => Ok(()),
        }
    }

    fn accept(&self, messages: Vec<Message>) -> Result<(), PublishError> {
        let mut state = self.state.lock().map_err(|_| PublishError::Poisoned)?;
        state.batches.push(messages.len());
        state.delivered.extend(messages);
        Ok(())
    }
}

impl Publisher for InMemoryPublisher {
    fn publish(&self, message: Message) -> Result<(), PublishError> {
        self.check(&message)?;
        self.accept(vec![message])
    }

    fn publish_batch(&self, messages: Vec<Message>) -> Result<(), PublishError> {
        for message in &messages {
            self.check(message)?;
        }
        self.accept(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_messages_and_batches() {
        let publisher = InMemoryPublisher::new();

        publisher.publish(Message::json("", "jobs", json!({"id": 1}))).unwrap();
        publisher
            .publish_batch(vec![
                Message::json("", "jobs", json!({"id": 2})),
                Message::json("", "jobs", json!({"id": 3})),
            ])
            .unwrap();

        assert_eq!(publisher.batch_sizes(), vec![1, 2]);
        assert_eq!(
            publisher.delivered_bodies(),
            vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]
        );
    }

    #[test]
    fn rejected_batch_is_not_recorded() {
        let publisher = InMemoryPublisher::rejecting(|m| m.body()["id"] == json!(2));

        publisher.publish(Message::json("", "jobs", json!({"id": 1}))).unwrap();
        let err = publisher
            .publish_batch(vec![
                Message::json("", "jobs", json!({"id": 3})),
                Message::json("", "jobs", json!({"id": 2})),
            ])
            .unwrap_err();

        assert!(matches!(err, PublishError::Rejected(_)));
        assert_eq!(publisher.batch_sizes(), vec![1]);
        assert_eq!(publisher.delivered_bodies(), vec![json!({"id": 1})]);
    }

    #[test]
    fn message_headers_and_defaults() {
        let m = Message::json("smartcoop", "jobs.created", json!({"id": 1})).with_header("signal", "job_signal");
        assert_eq!(m.exchange(), "smartcoop");
        assert_eq!(m.routing_key(), "jobs.created");
        assert_eq!(m.content_type(), "application/json");
        assert_eq!(m.header("signal"), Some("job_signal"));
        assert_eq!(m.header("missing"), None);
    }
}
