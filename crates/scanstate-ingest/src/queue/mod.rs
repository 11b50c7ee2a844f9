//! Message queue abstraction
//!
//! The ingestor only needs two things from a queue: a [`Subscription`] that
//! yields delivered messages, and a way to settle each [`InboundMessage`]
//! exactly once. Settling consumes the message, so a handler cannot both
//! acknowledge and reject the same delivery.
//!
//! Implementations:
//!
//! - [`postgres`]: durable queue in the `scan_messages` table, leased
//!   claims with `FOR UPDATE SKIP LOCKED`, back-off on rejection
//! - [`memory`]: channel-backed queue that records every settlement, for tests
//! - [`lines`]: newline-delimited messages from any async reader (stdin replay)

use async_trait::async_trait;
use thiserror::Error;

pub mod lines;
pub mod memory;
pub mod postgres;

pub use lines::{LineMessage, LinesSubscription};
pub use memory::{Disposition, MemoryMessage, MemoryQueue, MemorySubscription, Settlement};
pub use postgres::{PgMessage, PgQueue, PgQueueConfig, PgSubscription, QueueDepth};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The message was re-leased to another consumer before it was settled
    #[error("Lease on message {0} was lost before settlement")]
    LeaseLost(String),

    #[error("Queue already has an active subscription")]
    AlreadySubscribed,
}

pub type QueueResult<T> = Result<T, QueueError>;

/// One delivery of a queued message
#[async_trait]
pub trait InboundMessage: Send + Sync + 'static {
    /// Queue-assigned identifier, stable across redeliveries
    fn id(&self) -> &str;

    fn body(&self) -> &[u8];

    /// 1 for the first delivery, incremented on each redelivery
    fn delivery_attempt(&self) -> u32;

    /// Signal successful consumption; the queue will not deliver it again
    async fn ack(self) -> QueueResult<()>;

    /// Signal failure; the queue's retry policy decides on redelivery
    async fn nack(self) -> QueueResult<()>;
}

/// A stream of deliveries from one subscription
#[async_trait]
pub trait Subscription: Send {
    type Message: InboundMessage;

    /// Wait for the next delivery. `Ok(None)` means the subscription is
    /// exhausted and will never yield again.
    async fn next(&mut self) -> QueueResult<Option<Self::Message>>;

    /// Release the subscription once no more deliveries will be taken
    async fn close(&mut self) -> QueueResult<()> {
        Ok(())
    }
}
