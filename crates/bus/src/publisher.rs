//! Message publishing abstraction (mechanics only).
//!
//! Signals are written to outbox tables inside the business transaction and
//! handed to a [`Publisher`] only after that transaction committed. The
//! publisher is therefore the *transport* end of the outbox:
//!
//! ```text
//! unit of work → outbox row (commit) → dispatcher → Publisher → broker
//! ```
//!
//! ## Delivery Guarantees
//!
//! The outbox gives **at-least-once delivery**. A row is deleted only after
//! its message was accepted, so a crash between publishing and deleting
//! re-sends the message on the next flush. Consumers must be idempotent
//! (de-duplicate on [`Message::message_id`](crate::Message::message_id) or on
//! a business key carried in the body).
//!
//! ## Error Handling
//!
//! `publish()` failures are surfaced to the dispatcher, which rolls back the
//! sub-transaction that was about to delete the row. The row stays pending and
//! is retried by a later flush.

use std::sync::Arc;

use thiserror::Error;

use crate::message::Message;

/// Errors a publisher can report.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The broker refused the message.
    #[error("message rejected: {0}")]
    Rejected(String),

    /// The broker could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The message could not be encoded for the wire.
    #[error("serialization error: {0}")]
    Serialize(String),

    /// Internal lock poisoning.
    #[error("publisher lock poisoned")]
    Poisoned,
}

/// Transport that delivers messages to a broker.
///
/// The trait requires `Send + Sync`: one publisher is shared by every flush
/// (explicit or commit-triggered), possibly from several threads.
pub trait Publisher: Send + Sync {
    fn publish(&self, message: Message) -> Result<(), PublishError>;

    /// Publish several messages as one unit.
    ///
    /// The default publishes them one by one and stops at the first failure.
    /// Transports with native batching (pipelines, publisher confirms) should
    /// override it.
    fn publish_batch(&self, messages: Vec<Message>) -> Result<(), PublishError> {
        for message in messages {
            self.publish(message)?;
        }
        Ok(())
    }
}

impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    fn publish(&self, message: Message) -> Result<(), PublishError> {
        (**self).publish(message)
    }

    fn publish_batch(&self, messages: Vec<Message>) -> Result<(), PublishError> {
        (**self).publish_batch(messages)
    }
}
