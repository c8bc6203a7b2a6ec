//! Queue access.
//!
//! A [`QueueReaderFactory`] owns the broker connection and hands out one
//! [`QueueReader`] per named queue. Readers yield [`QueueMessage`]s that are
//! redelivered by the broker unless acknowledged.
//!
//! Two implementations exist:
//! - [`amqp::AmqpReaderFactory`] for AMQP 1.0 brokers (including Azure
//!   Service Bus)
//! - [`memory::InMemoryBroker`] for development and tests

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use amqp::AmqpReaderFactory;
pub use memory::InMemoryBroker;

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to receive from {queue}: {message}")]
    Receive { queue: String, message: String },

    #[error("reader for {0} is closed")]
    Closed(String),

    #[error("failed to acknowledge message: {0}")]
    Ack(String),

    #[error("broker unreachable after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Creates readers for named queues over a shared broker connection.
#[async_trait]
pub trait QueueReaderFactory: Send + Sync {
    /// Open a reader on `queue_name`, reconnecting as needed. Fails only once
    /// the connection retry budget is exhausted.
    async fn new_reader(&self, queue_name: &str) -> Result<Box<dyn QueueReader>, QueueError>;

    /// Close the underlying broker connection.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Reads messages from one queue.
///
/// `read` must be cancel-safe: dropping an in-flight read never loses a
/// message.
#[async_trait]
pub trait QueueReader: Send {
    /// Wait for the next message.
    async fn read(&mut self) -> Result<QueueMessage, QueueError>;

    /// Release the reader. Un-acknowledged messages become eligible for
    /// redelivery. Closing twice is harmless.
    async fn close(&mut self) -> Result<(), QueueError>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;
}

/// A message read from a queue.
pub struct QueueMessage {
    body: String,
    acker: Box<dyn Acknowledger>,
}

impl QueueMessage {
    pub fn new(body: impl Into<String>, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body: body.into(),
            acker,
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Acknowledge the message so it is not redelivered.
    ///
    /// A no-op if the reader it came from has already been closed.
    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMessage")
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}
