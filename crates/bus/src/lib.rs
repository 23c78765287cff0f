//! Message bus contract for delivering outbox signals.

pub mod in_memory;
pub mod message;
pub mod publisher;

pub use in_memory::InMemoryPublisher;
pub use message::Message;
pub use publisher::{PublishError, Publisher};
